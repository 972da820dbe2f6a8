//! Authenticator selection and credential lookup.

use std::sync::OnceLock;

use bf_core::{AuthConfig, AuthInfo, CredentialBundle, FarmConfig, ObjectStore};
use tracing::info;

use crate::error::AuthResult;

/// Source of the farm's TLS material.
#[derive(Debug)]
pub enum Authenticator {
    /// No authentication: servers get empty material, clients get nothing.
    NoOp,
    /// Bundle stored as one JSON object in the object store.
    Simple(SimpleAuthenticator),
}

impl Authenticator {
    pub fn for_config(config: &FarmConfig) -> Self {
        match &config.auth {
            None => Authenticator::NoOp,
            Some(AuthConfig::Simple { bucket, key }) => {
                Authenticator::Simple(SimpleAuthenticator::new(bucket, key))
            }
        }
    }

    /// Material templated into server and worker stacks.
    pub fn server_auth_info<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
    ) -> AuthResult<CredentialBundle> {
        match self {
            Authenticator::NoOp => Ok(CredentialBundle::default()),
            Authenticator::Simple(simple) => simple.bundle(store).cloned(),
        }
    }

    /// Material forwarded to build clients, if any.
    pub fn client_auth_info<S: ObjectStore + ?Sized>(
        &self,
        store: &S,
    ) -> AuthResult<Option<AuthInfo>> {
        match self {
            Authenticator::NoOp => Ok(None),
            Authenticator::Simple(simple) => Ok(Some(simple.bundle(store)?.client_auth_info())),
        }
    }
}

#[derive(Debug)]
pub struct SimpleAuthenticator {
    bucket: String,
    key: String,
    bundle: OnceLock<CredentialBundle>,
}

impl SimpleAuthenticator {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            bundle: OnceLock::new(),
        }
    }

    /// Fetch the bundle on first use; later calls reuse it.
    fn bundle<S: ObjectStore + ?Sized>(&self, store: &S) -> AuthResult<&CredentialBundle> {
        if let Some(bundle) = self.bundle.get() {
            return Ok(bundle);
        }
        let raw = store.get_object(&self.bucket, &self.key)?;
        let bundle: CredentialBundle = serde_json::from_slice(&raw)?;
        info!(bucket = %self.bucket, key = %self.key, "credential bundle loaded");
        // A concurrent loader may have won; either copy is identical.
        Ok(self.bundle.get_or_init(|| bundle))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use bf_core::{BackendError, BackendResult, ObjectHead};

    use super::*;

    struct OneObject {
        body: Vec<u8>,
        gets: Cell<u32>,
    }

    impl ObjectStore for OneObject {
        fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Vec<u8>> {
            self.gets.set(self.gets.get() + 1);
            if (bucket, key) == ("b", "k") {
                Ok(self.body.clone())
            } else {
                Err(BackendError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
        }

        fn head_object(&self, _: &str, _: &str) -> BackendResult<Option<ObjectHead>> {
            Ok(None)
        }

        fn put_object(&self, _: &str, _: &str, _: &[u8], _: &str) -> BackendResult<String> {
            unimplemented!()
        }
    }

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            ca_crt: "ca".to_string(),
            client_crt: "client".to_string(),
            client_pkcs8_key: "client-key".to_string(),
            server_crt: "server".to_string(),
            server_pkcs8_key: "server-key".to_string(),
        }
    }

    fn store() -> OneObject {
        OneObject {
            body: serde_json::to_vec(&bundle()).unwrap(),
            gets: Cell::new(0),
        }
    }

    #[test]
    fn noop_has_empty_server_material() {
        let auth = Authenticator::NoOp;
        let store = store();
        assert_eq!(auth.server_auth_info(&store).unwrap(), CredentialBundle::default());
        assert_eq!(auth.client_auth_info(&store).unwrap(), None);
        assert_eq!(store.gets.get(), 0);
    }

    #[test]
    fn simple_reads_bundle_once() {
        let auth = Authenticator::Simple(SimpleAuthenticator::new("b", "k"));
        let store = store();

        assert_eq!(auth.server_auth_info(&store).unwrap(), bundle());
        let client = auth.client_auth_info(&store).unwrap().unwrap();
        assert_eq!(client.tls_certificate, "ca");
        assert_eq!(client.tls_client_certificate, "client");
        assert_eq!(client.tls_client_key, "client-key");
        assert_eq!(store.gets.get(), 1);
    }

    #[test]
    fn missing_object_is_an_error() {
        let auth = Authenticator::Simple(SimpleAuthenticator::new("b", "absent"));
        assert!(auth.server_auth_info(&store()).is_err());
    }

    #[test]
    fn malformed_bundle_is_an_error() {
        let auth = Authenticator::Simple(SimpleAuthenticator::new("b", "k"));
        let store = OneObject {
            body: b"{\"ca_crt\": 1}".to_vec(),
            gets: Cell::new(0),
        };
        assert!(matches!(
            auth.server_auth_info(&store),
            Err(crate::AuthError::Malformed(_))
        ));
    }
}
