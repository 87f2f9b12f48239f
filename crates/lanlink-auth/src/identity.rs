//! Session identity derived from a login request

use lanlink_proto::{LoginRequest, DEFAULT_NETWORK};

/// Who a point claims to be.
///
/// `name@network` is the credential key; `uuid` identifies the device and
/// is what leases and single-session checks are keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub network: String,
    pub password: String,
    pub token: String,
    pub alias: String,
    pub uuid: String,
    pub system: String,
}

impl Identity {
    pub fn from_login(login: &LoginRequest) -> Self {
        let mut identity = Self {
            name: login.name.clone(),
            network: login.network.clone(),
            password: login.password.clone(),
            token: login.token.clone(),
            alias: login.alias.clone(),
            uuid: login.uuid.clone(),
            system: login.system.clone(),
        };
        identity.normalize();
        identity
    }

    /// Split `name@network`, default the network, lower-case the alias and
    /// fall back to the alias for a missing uuid
    pub fn normalize(&mut self) {
        if let Some((name, network)) = self.name.split_once('@') {
            self.network = network.to_string();
            self.name = name.to_string();
        }
        if self.network.is_empty() {
            self.network = DEFAULT_NETWORK.to_string();
        }
        self.alias = self.alias.to_lowercase();
        if self.uuid.is_empty() {
            self.uuid = self.alias.clone();
        }
    }

    /// Credential key, `name@network`
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_with_network() {
        let identity = Identity::from_login(&LoginRequest {
            name: "hi@lab".to_string(),
            alias: "Laptop-01".to_string(),
            ..Default::default()
        });
        assert_eq!(identity.name, "hi");
        assert_eq!(identity.network, "lab");
        assert_eq!(identity.alias, "laptop-01");
        assert_eq!(identity.uuid, "laptop-01");
        assert_eq!(identity.id(), "hi@lab");
    }

    #[test]
    fn test_default_network() {
        let identity = Identity::from_login(&LoginRequest {
            name: "hi".to_string(),
            uuid: "5c1b".to_string(),
            ..Default::default()
        });
        assert_eq!(identity.id(), "hi@default");
        assert_eq!(identity.uuid, "5c1b");
    }

    #[test]
    fn test_name_suffix_overrides_network_field() {
        let identity = Identity::from_login(&LoginRequest {
            name: "hi@lab".to_string(),
            network: "other".to_string(),
            ..Default::default()
        });
        assert_eq!(identity.network, "lab");
    }
}
