//! The demo `UserService` hosted by `krpc provide`.

use async_trait::async_trait;
use krpc_common::protocol::{
    InterfaceDescriptor, KrpcError, MethodDescriptor, Result, TypeDescriptor, Value,
};
use krpc_server::RpcService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

pub const USER_SERVICE: &str = "UserService";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

/// Both methods are idempotent: reads, and inserts keyed by user id.
pub fn user_service_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new(USER_SERVICE)
        .method(MethodDescriptor::new("getUserByUserId", vec![TypeDescriptor::Int]).retryable())
        .method(
            MethodDescriptor::new("insertUserId", vec![TypeDescriptor::Named("User".to_string())])
                .retryable(),
        )
}

pub struct UserService {
    descriptor: InterfaceDescriptor,
    users: RwLock<BTreeMap<i64, User>>,
}

impl UserService {
    pub fn new() -> Self {
        Self {
            descriptor: user_service_interface(),
            users: RwLock::new(BTreeMap::new()),
        }
    }

    /// Pre-populated with a few users.
    pub fn with_sample_users() -> Self {
        let users = [(1, "ada"), (2, "grace"), (3, "barbara")]
            .into_iter()
            .map(|(id, name)| {
                (
                    id,
                    User {
                        id,
                        name: name.to_string(),
                    },
                )
            })
            .collect();
        Self {
            descriptor: user_service_interface(),
            users: RwLock::new(users),
        }
    }
}

impl Default for UserService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcService for UserService {
    fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let Some(param) = params.into_iter().next() else {
            return Err(KrpcError::InvalidArgument(format!("{} takes one parameter", method)));
        };

        match method {
            "getUserByUserId" => {
                let id: i64 = param
                    .decode()
                    .map_err(|e| KrpcError::InvalidArgument(e.to_string()))?;
                match self.users.read().await.get(&id) {
                    Some(user) => Value::encode(user),
                    None => Ok(Value::Null),
                }
            }
            "insertUserId" => {
                let user: User = param
                    .decode()
                    .map_err(|e| KrpcError::InvalidArgument(e.to_string()))?;
                tracing::debug!("Inserting user {}", user.id);
                let id = user.id;
                self.users.write().await.insert(id, user);
                Ok(Value::Int(id))
            }
            other => Err(KrpcError::ServiceNotFound(format!(
                "{}#{}",
                USER_SERVICE, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_get() {
        let service = UserService::new();
        let user = User {
            id: 7,
            name: "linus".to_string(),
        };

        let id = service
            .invoke("insertUserId", vec![Value::encode(&user).unwrap()])
            .await
            .unwrap();
        assert_eq!(id, Value::Int(7));

        let found: User = service
            .invoke("getUserByUserId", vec![Value::Int(7)])
            .await
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(found, user);
    }

    #[tokio::test]
    async fn test_missing_user_is_null() {
        let service = UserService::with_sample_users();
        let missing = service
            .invoke("getUserByUserId", vec![Value::Int(99)])
            .await
            .unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[tokio::test]
    async fn test_bad_parameter() {
        let service = UserService::new();
        let result = service
            .invoke("getUserByUserId", vec![Value::from("one")])
            .await;
        assert!(matches!(result, Err(KrpcError::InvalidArgument(_))));
    }

    #[test]
    fn test_retryable_signatures() {
        assert_eq!(
            user_service_interface().retryable_signatures(),
            vec![
                "UserService#getUserByUserId(int)".to_string(),
                "UserService#insertUserId(User)".to_string(),
            ]
        );
    }
}
