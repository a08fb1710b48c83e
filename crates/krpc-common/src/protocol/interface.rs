//! Interface definitions shared by providers and callers.
//!
//! An [`InterfaceDescriptor`] is the hand-written counterpart of a remote
//! interface: its methods, their parameter types and whether each one is
//! idempotent. Providers publish the retryable signatures to the registry;
//! callers consult the same descriptor before re-sending a failed call.

use super::requests::method_signature;
use super::value::TypeDescriptor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub param_types: Vec<TypeDescriptor>,
    /// Safe to re-invoke after a failed attempt
    pub retryable: bool,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, param_types: Vec<TypeDescriptor>) -> Self {
        Self {
            name: name.into(),
            param_types,
            retryable: false,
        }
    }

    /// Marks the method idempotent.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn find(&self, method_name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == method_name)
    }

    /// Signatures of every retryable method, as registered with the registry.
    pub fn retryable_signatures(&self) -> Vec<String> {
        self.methods
            .iter()
            .filter(|m| m.retryable)
            .map(|m| method_signature(&self.name, &m.name, &m.param_types))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_signatures() {
        let interface = InterfaceDescriptor::new("UserService")
            .method(MethodDescriptor::new("getUserByUserId", vec![TypeDescriptor::Int]).retryable())
            .method(MethodDescriptor::new("deleteUser", vec![TypeDescriptor::Int]));

        assert_eq!(
            interface.retryable_signatures(),
            vec!["UserService#getUserByUserId(int)".to_string()]
        );
        assert!(!interface.find("deleteUser").unwrap().retryable);
        assert!(interface.find("missing").is_none());
    }
}
