use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use thiserror::Error;

pub const TOKEN_KEY: &str = "token";
pub const USER_DATA_KEY: &str = "userData";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Secret {0} not found")]
    SecretMissing(String),
    #[error("Secret {0} has no {1} key")]
    KeyMissing(String, &'static str),
    #[error("Secret {0} key {1} is not UTF-8")]
    NotUtf8(String, &'static str),
    #[error("k8s error: {0}")]
    KubeError(#[source] kube::Error),
}

/// Cloud and bootstrap credentials referenced by a fleet.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    /// cloud-init payload handed to new servers
    pub user_data: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user_data", &self.user_data.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credentials(&self, namespace: &str, name: &str) -> Result<Credentials, CredentialError>;
}

pub struct SecretCredentials {
    pub client: Client,
}

fn secret_value(secret: &Secret, name: &str, key: &'static str) -> Result<Option<String>, CredentialError> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(value.0.clone())
            .map(Some)
            .map_err(|_| CredentialError::NotUtf8(name.to_string(), key));
    }
    Ok(secret.string_data.as_ref().and_then(|d| d.get(key)).cloned())
}

#[async_trait]
impl CredentialStore for SecretCredentials {
    async fn credentials(&self, namespace: &str, name: &str) -> Result<Credentials, CredentialError> {
        let secrets = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await
            .map_err(CredentialError::KubeError)?
            .ok_or_else(|| CredentialError::SecretMissing(format!("{namespace}/{name}")))?;
        let token = secret_value(&secret, name, TOKEN_KEY)?
            .ok_or(CredentialError::KeyMissing(name.to_string(), TOKEN_KEY))?;
        Ok(Credentials {
            token,
            user_data: secret_value(&secret, name, USER_DATA_KEY)?,
        })
    }
}
