//! Minimal JID value type.
//!
//! Components only need to address themselves and echo addresses back, so
//! no stringprep normalization is performed.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An XMPP address of the form `[node@]domain[/resource]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// A bare domain JID, as used for a component's own address.
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            node: None,
            domain: domain.into(),
            resource: None,
        }
    }

    /// Build a JID from its parts.
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            node: node.filter(|n| !n.is_empty()).map(str::to_string),
            domain: domain.to_string(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }

    /// Local part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Domain part.
    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    /// Resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID with its resource stripped.
    #[must_use]
    pub fn to_bare(&self) -> Self {
        Self {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(Error::InvalidPacket(format!("JID without domain: '{s}'")));
        }
        Ok(Self::new(node, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@example.com/phone".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain_part(), "example.com");
        assert_eq!(jid.resource(), Some("phone"));
        assert_eq!(jid.to_string(), "alice@example.com/phone");
    }

    #[test]
    fn test_resource_may_contain_slashes_and_at() {
        let jid: Jid = "room@conf.example.com/nick/with@odd".parse().unwrap();
        assert_eq!(jid.resource(), Some("nick/with@odd"));
        assert_eq!(jid.to_bare().to_string(), "room@conf.example.com");
    }

    #[test]
    fn test_domain_only() {
        let jid = Jid::domain("echo.example.com");
        assert_eq!(jid.to_string(), "echo.example.com");
        assert!(jid.node().is_none());
    }

    #[test]
    fn test_empty_domain_rejected() {
        assert!("alice@".parse::<Jid>().is_err());
        assert!("".parse::<Jid>().is_err());
    }
}
