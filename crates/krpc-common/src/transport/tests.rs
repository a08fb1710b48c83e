//! Tests for the frame codec
//!
//! These tests verify header layout, incremental decoding across arbitrary
//! split points and the protocol errors raised for malformed headers.

#[cfg(test)]
mod tests {
    use crate::protocol::{KrpcError, Message, RequestEnvelope, ResponseEnvelope, Value};
    use crate::transport::frame::{self, Frame, FrameCodec, MessageKind, HEADER_SIZE};
    use crate::transport::SerializerKind;
    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    fn request() -> Message {
        Message::Request(RequestEnvelope::new(
            "UserService",
            "getUserByUserId",
            vec![Value::Int(42)],
        ))
    }

    fn encoded(message: &Message, serializer: SerializerKind) -> BytesMut {
        let mut buf = BytesMut::new();
        frame::encode(message, serializer, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let message = request();
        let buf = encoded(&message, SerializerKind::Json);
        let payload = SerializerKind::Json.serialize(&message).unwrap();

        assert_eq!(&buf[0..2], &1u16.to_be_bytes());
        assert_eq!(&buf[2..4], &3u16.to_be_bytes());
        assert_eq!(&buf[4..8], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[HEADER_SIZE..], payload.as_slice());
    }

    #[test]
    fn test_response_kind_code() {
        let message = Message::Response(ResponseEnvelope::success(Value::Bool(true)));
        let buf = encoded(&message, SerializerKind::Postcard);
        assert_eq!(&buf[0..2], &2u16.to_be_bytes());
        assert_eq!(&buf[2..4], &4u16.to_be_bytes());
    }

    #[test]
    fn test_decode_round_trip_per_serializer() {
        for serializer in [SerializerKind::Json, SerializerKind::Postcard] {
            let message = request();
            let mut buf = encoded(&message, serializer);
            let decoded = frame::decode(&mut buf).unwrap();
            assert_eq!(decoded, Some(message));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_every_split_point() {
        let message = request();
        let wire = encoded(&message, SerializerKind::Json);

        for split in 0..wire.len() {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);

            assert!(
                codec.decode(&mut buf).unwrap().is_none(),
                "emitted a frame with only {} of {} bytes",
                split,
                wire.len()
            );
            // Nothing is consumed while waiting
            assert_eq!(buf.len(), split);

            buf.extend_from_slice(&wire[split..]);
            let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(frame.to_message().unwrap(), message);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let first = request();
        let second = Message::Request(RequestEnvelope::heartbeat());
        let mut buf = encoded(&first, SerializerKind::Json);
        buf.extend_from_slice(&encoded(&second, SerializerKind::Postcard));

        assert_eq!(frame::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(frame::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(frame::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_message_kind_is_protocol_error() {
        let mut buf = encoded(&request(), SerializerKind::Json);
        buf[0..2].copy_from_slice(&7u16.to_be_bytes());
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(KrpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_serializer_is_protocol_error() {
        let mut buf = encoded(&request(), SerializerKind::Json);
        buf[2..4].copy_from_slice(&99u16.to_be_bytes());
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(KrpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_zero_length_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(3);
        buf.put_u32(0);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(KrpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(3);
        buf.put_u32(u32::MAX);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(KrpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_payload_is_serialization_error_not_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(3);
        buf.put_u32(3);
        buf.put_slice(b"{{{");

        let frame = FrameCodec.decode(&mut buf).unwrap().expect("frame is well formed");
        assert_eq!(frame.kind, MessageKind::Request);
        assert!(matches!(
            frame.to_message(),
            Err(KrpcError::Serialization(_))
        ));
    }

    #[test]
    fn test_encoder_matches_free_function() {
        let message = request();
        let frame = Frame::from_message(&message, SerializerKind::Postcard).unwrap();

        let mut via_encoder = BytesMut::new();
        FrameCodec.encode(frame, &mut via_encoder).unwrap();

        assert_eq!(via_encoder, encoded(&message, SerializerKind::Postcard));
    }
}
