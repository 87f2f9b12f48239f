//! Credential store shared by every connection of a switch

use crate::identity::Identity;
use crate::password::verify_secret;
use crate::{AuthError, AuthResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Member,
    /// Only the most recent connection of a guest credential stays online
    Guest,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "" | "member" | "user" => Ok(Role::Member),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub network: String,
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

impl Credential {
    pub fn new(
        name: impl Into<String>,
        network: impl Into<String>,
        password: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            password: password.into(),
            role,
        }
    }

    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.network)
    }
}

/// `name@network` keyed credentials
pub struct CredentialStore {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
        }
    }

    /// Load a credentials file: one `name@network:password[:role]` per line,
    /// `#` starts a comment
    pub fn from_file(path: &Path) -> AuthResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Io(format!("{}: {}", path.display(), e)))?;
        let credentials = parse_credentials(&content)?;
        info!(path = %path.display(), count = credentials.len(), "Loaded credentials");
        Ok(Self {
            credentials: RwLock::new(
                credentials
                    .into_iter()
                    .map(|credential| (credential.id(), credential))
                    .collect(),
            ),
        })
    }

    pub async fn add(&self, credential: Credential) {
        let id = credential.id();
        debug!(user = %id, role = ?credential.role, "Adding credential");
        self.credentials.write().await.insert(id, credential);
    }

    pub async fn remove(&self, id: &str) -> Option<Credential> {
        self.credentials.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.credentials.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Credential> {
        self.credentials.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.read().await.is_empty()
    }

    /// Resolve `identity` to its stored credential.
    ///
    /// Unknown users and wrong passwords are indistinguishable to the caller.
    pub async fn authenticate(&self, identity: &Identity) -> AuthResult<Credential> {
        let id = identity.id();
        let credentials = self.credentials.read().await;
        match credentials.get(&id) {
            Some(credential) if verify_secret(&credential.password, &identity.password) => {
                Ok(credential.clone())
            }
            Some(_) => {
                debug!(user = %id, "Password mismatch");
                Err(AuthError::BadCredential(id))
            }
            None => {
                debug!(user = %id, "Unknown user");
                Err(AuthError::BadCredential(id))
            }
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_credentials(content: &str) -> AuthResult<Vec<Credential>> {
    let mut credentials = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let invalid = |reason: &str| AuthError::InvalidEntry {
            line: index + 1,
            reason: reason.to_string(),
        };

        // hashed passwords contain '$' but never ':'
        let mut fields = line.splitn(3, ':');
        let user = fields.next().unwrap_or_default();
        let password = fields.next().ok_or_else(|| invalid("missing password"))?;
        let role = match fields.next() {
            Some(role) => role.parse::<Role>().map_err(|e| invalid(&e))?,
            None => Role::default(),
        };

        let mut identity = Identity {
            name: user.to_string(),
            ..Default::default()
        };
        identity.normalize();
        if identity.name.is_empty() {
            return Err(invalid("empty user name"));
        }
        credentials.push(Credential::new(
            identity.name,
            identity.network,
            password,
            role,
        ));
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity(name: &str, password: &str) -> Identity {
        let mut identity = Identity {
            name: name.to_string(),
            password: password.to_string(),
            ..Default::default()
        };
        identity.normalize();
        identity
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = CredentialStore::new();
        store
            .add(Credential::new("hi", "lab", "pw", Role::Guest))
            .await;

        let credential = store.authenticate(&identity("hi@lab", "pw")).await.unwrap();
        assert_eq!(credential.role, Role::Guest);

        assert_eq!(
            store.authenticate(&identity("hi@lab", "nope")).await,
            Err(AuthError::BadCredential("hi@lab".to_string()))
        );
        assert!(store.authenticate(&identity("hi", "pw")).await.is_err());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = CredentialStore::new();
        store
            .add(Credential::new("hi", "default", "pw", Role::Member))
            .await;
        assert_eq!(store.len().await, 1);
        assert!(store.remove("hi@default").await.is_some());
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_parse_credentials() {
        let credentials = parse_credentials(
            "# users\nhi@lab:pw:guest\n\nadmin:$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA\n",
        )
        .unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].id(), "hi@lab");
        assert_eq!(credentials[0].role, Role::Guest);
        assert_eq!(credentials[1].id(), "admin@default");
        assert!(credentials[1].password.starts_with("$argon2id$"));
    }

    #[test]
    fn test_parse_credentials_errors() {
        assert!(matches!(
            parse_credentials("hi@lab"),
            Err(AuthError::InvalidEntry { line: 1, .. })
        ));
        assert!(matches!(
            parse_credentials("ok:pw\nhi:pw:superuser"),
            Err(AuthError::InvalidEntry { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hi@lab:pw").unwrap();
        let store = CredentialStore::from_file(file.path()).unwrap();
        assert!(store.authenticate(&identity("hi@lab", "pw")).await.is_ok());
    }
}
