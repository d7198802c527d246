use std::fmt;

/// Everything needed to open one broker session.
///
/// Two configs are equal only when every field matches; the session manager
/// relies on that to decide whether a reconfiguration needs a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub client_id: String,
    pub state_topic: String,
    pub command_topic: String,
    pub pending_delay_secs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            client_id: "alarmpanel".to_string(),
            state_topic: "home/alarm".to_string(),
            command_topic: "home/alarm/set".to_string(),
            pending_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigProblem {
    #[error("broker host is empty")]
    EmptyHost,
    #[error("broker port must not be 0")]
    ZeroPort,
    #[error("client id is empty")]
    EmptyClientId,
    #[error("state topic is empty")]
    EmptyStateTopic,
    #[error("command topic is empty")]
    EmptyCommandTopic,
    #[error("command topic must not contain wildcards: {0}")]
    WildcardCommandTopic(String),
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigProblem> {
        if self.host.trim().is_empty() {
            return Err(ConfigProblem::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigProblem::ZeroPort);
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigProblem::EmptyClientId);
        }
        if self.state_topic.trim().is_empty() {
            return Err(ConfigProblem::EmptyStateTopic);
        }
        if self.command_topic.trim().is_empty() {
            return Err(ConfigProblem::EmptyCommandTopic);
        }
        if self.command_topic.contains(&['+', '#'][..]) {
            return Err(ConfigProblem::WildcardCommandTopic(self.command_topic.clone()));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SessionConfig {
    /// Shown as `user@host:port`; the password is never printed.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        match &self.username {
            Some(user) => write!(f, "{}://{}@{}", scheme, user, self.address()),
            None => write!(f, "{}://{}", scheme, self.address()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SessionConfig::default().validate(), Ok(()));
    }

    #[test]
    fn empty_host_is_rejected() {
        let config = SessionConfig {
            host: "  ".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigProblem::EmptyHost));
    }

    #[test]
    fn wildcard_command_topic_is_rejected() {
        let config = SessionConfig {
            command_topic: "home/+/set".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigProblem::WildcardCommandTopic(_))
        ));
    }

    #[test]
    fn equality_covers_every_field() {
        let base = SessionConfig::default();
        let other = SessionConfig {
            pending_delay_secs: base.pending_delay_secs + 1,
            ..base.clone()
        };
        assert_ne!(base, other);
        assert_eq!(base, base.clone());
    }

    #[test]
    fn display_hides_password() {
        let config = SessionConfig {
            username: Some("panel".to_string()),
            password: Some("secret".to_string()),
            tls: true,
            ..SessionConfig::default()
        };
        let shown = config.to_string();
        assert_eq!(shown, "mqtts://panel@localhost:1883");
        assert!(!shown.contains("secret"));
    }
}
