use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Object wildcard used by handlers that act on the whole log.
pub const OBJECT_WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Get,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Get => "get",
        }
    }
}

impl std::str::FromStr for Action {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Action::Create),
            "get" => Ok(Action::Get),
            other => Err(AuthError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{subject:?} is not permitted to {action} to {object:?}")]
    Denied {
        subject: String,
        object: String,
        action: &'static str,
    },

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transport-established identity of a connected client.
///
/// The subject is the TLS client certificate common name when the serving
/// layer terminated TLS with client auth; `None` (treated as the empty
/// subject) otherwise.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    pub subject: Option<String>,
}

impl PeerIdentity {
    /// Identity carried by a TLS client certificate: the subject is the
    /// leaf certificate's common name. A certificate without one, or one
    /// that does not parse, yields the anonymous identity.
    pub fn from_client_cert(der: &[u8]) -> PeerIdentity {
        use x509_parser::prelude::{FromDer, X509Certificate};

        let subject = match X509Certificate::from_der(der) {
            Ok((_, cert)) => cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable client certificate");
                None
            }
        };
        PeerIdentity { subject }
    }
}

/// Decides whether `subject` may perform `action` on `object`.
///
/// The subject is whatever identity the transport established, typically a
/// TLS client certificate common name; an empty string means no peer info.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, subject: &str, object: &str, action: Action) -> Result<(), AuthError>;
}

/// Table-driven authorizer: each subject maps to the set of actions it may
/// perform on any object.
#[derive(Debug, Default)]
pub struct AclAuthorizer {
    rules: HashMap<String, HashSet<Action>>,
}

impl AclAuthorizer {
    pub fn new() -> AclAuthorizer {
        AclAuthorizer::default()
    }

    /// Loads a policy of the form `{"root": ["create", "get"]}`.
    pub fn from_policy_file(path: impl AsRef<Path>) -> Result<AclAuthorizer, AuthError> {
        let raw = std::fs::read_to_string(path)?;
        let policy: HashMap<String, Vec<String>> = serde_json::from_str(&raw)
            .map_err(|e| AuthError::InvalidPolicy(e.to_string()))?;

        let mut acl = AclAuthorizer::new();
        for (subject, actions) in policy {
            for action in actions {
                acl.allow(&subject, action.parse()?);
            }
        }
        Ok(acl)
    }

    pub fn allow(&mut self, subject: &str, action: Action) -> &mut Self {
        self.rules
            .entry(subject.to_string())
            .or_default()
            .insert(action);
        self
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, subject: &str, object: &str, action: Action) -> Result<(), AuthError> {
        let allowed = self
            .rules
            .get(subject)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false);

        if !allowed {
            return Err(AuthError::Denied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.as_str(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_configured_subject() {
        let mut acl = AclAuthorizer::new();
        acl.allow("root", Action::Create).allow("root", Action::Get);

        assert!(acl.authorize("root", OBJECT_WILDCARD, Action::Create).is_ok());
        assert!(acl.authorize("root", OBJECT_WILDCARD, Action::Get).is_ok());
    }

    #[test]
    fn denies_unknown_subject() {
        let acl = AclAuthorizer::new();
        let err = acl
            .authorize("nobody", OBJECT_WILDCARD, Action::Create)
            .unwrap_err();
        assert!(matches!(err, AuthError::Denied { .. }));
    }

    #[test]
    fn partial_grants() {
        let mut acl = AclAuthorizer::new();
        acl.allow("reader", Action::Get);

        assert!(acl.authorize("reader", OBJECT_WILDCARD, Action::Get).is_ok());
        assert!(acl
            .authorize("reader", OBJECT_WILDCARD, Action::Create)
            .is_err());
    }

    #[test]
    fn client_cert_common_name_becomes_subject() {
        let mut params = rcgen::CertificateParams::new(vec!["client.test".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "root");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let identity = PeerIdentity::from_client_cert(cert.der().as_ref());
        assert_eq!(identity.subject.as_deref(), Some("root"));
    }

    #[test]
    fn cert_without_common_name_yields_no_subject() {
        let mut params = rcgen::CertificateParams::new(vec!["client.test".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        assert!(PeerIdentity::from_client_cert(cert.der().as_ref())
            .subject
            .is_none());
    }

    #[test]
    fn garbage_cert_yields_no_subject() {
        assert!(PeerIdentity::from_client_cert(&[0xde, 0xad, 0xbe, 0xef])
            .subject
            .is_none());
    }

    #[test]
    fn loads_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"root": ["create", "get"], "reader": ["get"]}"#).unwrap();

        let acl = AclAuthorizer::from_policy_file(&path).unwrap();
        assert!(acl.authorize("root", OBJECT_WILDCARD, Action::Create).is_ok());
        assert!(acl
            .authorize("reader", OBJECT_WILDCARD, Action::Create)
            .is_err());
    }
}
