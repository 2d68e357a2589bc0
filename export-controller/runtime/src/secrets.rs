//! Resolution of sink authentication credentials from namespaced secrets.

use kube::{Api, Client};
use telemetry_export_controller_k8s_api::{Secret, SecretKeyReference, SecretReference};

/// The semantic type a basic-auth credential secret must carry.
pub const BASIC_AUTH_TYPE: &str = "kubernetes.io/basic-auth";

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {name:?} not found")]
    NotFound { name: String },

    #[error("secret {name:?} has type {actual:?}, expected {BASIC_AUTH_TYPE:?}")]
    TypeMismatch { name: String, actual: String },

    #[error("secret {name:?} is missing the {key:?} field")]
    MissingField { name: String, key: &'static str },

    #[error("secret {name:?} has no {key:?} key")]
    MissingKey { name: String, key: String },

    #[error("secret {name:?} key {key:?} is not valid UTF-8")]
    InvalidUtf8 { name: String, key: String },

    #[error("failed to fetch secret {name:?}: {source}")]
    Api {
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl SecretError {
    /// Whether this error reports an absent secret, as opposed to a
    /// malformed one or an infrastructure failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transient store failures are retried rather than reported on the
    /// sink's status.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Looks up sink credentials in the policy's namespace.
#[async_trait::async_trait]
pub trait ResolveSecrets: Send + Sync {
    async fn resolve_basic_auth(
        &self,
        namespace: &str,
        secret_ref: &SecretReference,
    ) -> Result<BasicAuth, SecretError>;

    async fn resolve_bearer_token(
        &self,
        namespace: &str,
        secret_ref: &SecretKeyReference,
    ) -> Result<String, SecretError>;
}

/// Resolves secrets through the cluster the policy lives on.
#[derive(Clone)]
pub struct SecretStore {
    client: Client,
}

impl SecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, namespace: &str, name: &str) -> Result<Secret, SecretError> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|source| SecretError::Api {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl ResolveSecrets for SecretStore {
    async fn resolve_basic_auth(
        &self,
        namespace: &str,
        secret_ref: &SecretReference,
    ) -> Result<BasicAuth, SecretError> {
        let secret = self.fetch(namespace, &secret_ref.name).await?;
        basic_auth_from_secret(&secret_ref.name, &secret)
    }

    async fn resolve_bearer_token(
        &self,
        namespace: &str,
        secret_ref: &SecretKeyReference,
    ) -> Result<String, SecretError> {
        let secret = self.fetch(namespace, &secret_ref.name).await?;
        token_from_secret(&secret_ref.name, &secret_ref.key, &secret)
    }
}

/// Validates the shape of a basic-auth secret and extracts its credentials.
pub fn basic_auth_from_secret(name: &str, secret: &Secret) -> Result<BasicAuth, SecretError> {
    let type_ = secret.type_.as_deref().unwrap_or_default();
    if type_ != BASIC_AUTH_TYPE {
        return Err(SecretError::TypeMismatch {
            name: name.to_string(),
            actual: type_.to_string(),
        });
    }
    let field = |key: &'static str| -> Result<String, SecretError> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or(SecretError::MissingField {
                name: name.to_string(),
                key,
            })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| SecretError::InvalidUtf8 {
            name: name.to_string(),
            key: key.to_string(),
        })
    };
    Ok(BasicAuth {
        username: field(USERNAME_KEY)?,
        password: field(PASSWORD_KEY)?,
    })
}

/// Extracts a bearer token stored under `key`.
pub fn token_from_secret(name: &str, key: &str, secret: &Secret) -> Result<String, SecretError> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| SecretError::MissingKey {
            name: name.to_string(),
            key: key.to_string(),
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| SecretError::InvalidUtf8 {
        name: name.to_string(),
        key: key.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An in-memory resolver backed by a fixed set of (namespace, secret)
    /// pairs, applying the same shape checks as the real store.
    #[derive(Default)]
    pub(crate) struct StaticSecrets(pub(crate) Vec<(String, Secret)>);

    impl StaticSecrets {
        pub(crate) fn with(namespace: &str, secret: Secret) -> Self {
            Self(vec![(namespace.to_string(), secret)])
        }

        fn find(&self, namespace: &str, name: &str) -> Result<&Secret, SecretError> {
            self.0
                .iter()
                .find(|(ns, s)| {
                    ns == namespace && s.metadata.name.as_deref() == Some(name)
                })
                .map(|(_, s)| s)
                .ok_or_else(|| SecretError::NotFound {
                    name: name.to_string(),
                })
        }
    }

    #[async_trait::async_trait]
    impl ResolveSecrets for StaticSecrets {
        async fn resolve_basic_auth(
            &self,
            namespace: &str,
            secret_ref: &SecretReference,
        ) -> Result<BasicAuth, SecretError> {
            let secret = self.find(namespace, &secret_ref.name)?;
            basic_auth_from_secret(&secret_ref.name, secret)
        }

        async fn resolve_bearer_token(
            &self,
            namespace: &str,
            secret_ref: &SecretKeyReference,
        ) -> Result<String, SecretError> {
            let secret = self.find(namespace, &secret_ref.name)?;
            token_from_secret(&secret_ref.name, &secret_ref.key, secret)
        }
    }

    /// A well-formed basic-auth secret.
    pub(crate) fn basic_auth_secret(name: &str, username: &str, password: &str) -> Secret {
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some(BASIC_AUTH_TYPE.to_string()),
            data: Some(
                [
                    (
                        USERNAME_KEY.to_string(),
                        k8s_openapi::ByteString(username.as_bytes().to_vec()),
                    ),
                    (
                        PASSWORD_KEY.to_string(),
                        k8s_openapi::ByteString(password.as_bytes().to_vec()),
                    ),
                ]
                .into(),
            ),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::basic_auth_secret, *};

    #[test]
    fn extracts_basic_auth_credentials() {
        let secret = basic_auth_secret("grafana-auth", "reader", "hunter2");
        let auth = basic_auth_from_secret("grafana-auth", &secret).unwrap();
        assert_eq!(
            auth,
            BasicAuth {
                username: "reader".to_string(),
                password: "hunter2".to_string(),
            },
        );
    }

    #[test]
    fn rejects_wrong_secret_type() {
        let mut secret = basic_auth_secret("grafana-auth", "reader", "hunter2");
        secret.type_ = Some("Opaque".to_string());
        assert!(matches!(
            basic_auth_from_secret("grafana-auth", &secret),
            Err(SecretError::TypeMismatch { .. }),
        ));
    }

    #[test]
    fn rejects_missing_credential_fields() {
        let mut secret = basic_auth_secret("grafana-auth", "reader", "hunter2");
        secret
            .data
            .as_mut()
            .unwrap()
            .remove("password");
        assert!(matches!(
            basic_auth_from_secret("grafana-auth", &secret),
            Err(SecretError::MissingField { key: "password", .. }),
        ));
    }

    #[test]
    fn extracts_bearer_token_by_key() {
        let mut secret = basic_auth_secret("token", "x", "y");
        secret.type_ = Some("Opaque".to_string());
        secret.data.as_mut().unwrap().insert(
            "token".to_string(),
            k8s_openapi::ByteString(b"tok-123".to_vec()),
        );
        assert_eq!(
            token_from_secret("token", "token", &secret).unwrap(),
            "tok-123",
        );
        assert!(matches!(
            token_from_secret("token", "missing", &secret),
            Err(SecretError::MissingKey { .. }),
        ));
    }
}
