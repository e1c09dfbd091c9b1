// src/key.rs
//! Entity addressing.
//! Maps (hub, kind, id) to the stable address string a registry actor is
//! stored and subscribed under.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved separator between address parts. Ids may not contain it and hub
/// names may not contain `:` at all, which keeps the first separator unambiguous.
pub const SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed entity address '{raw}': {reason}")]
    Format { raw: String, reason: &'static str },
}

impl KeyError {
    fn format(raw: &str, reason: &'static str) -> Self {
        KeyError::Format {
            raw: raw.to_string(),
            reason,
        }
    }
}

/// The kind of addressable entity owning a connection set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    Group,
    User,
}

impl EntityKind {
    pub fn tag(self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Group => "group",
            EntityKind::User => "user",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "client" => Some(EntityKind::Client),
            "group" => Some(EntityKind::Group),
            "user" => Some(EntityKind::User),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    hub: String,
    kind: EntityKind,
    id: String,
}

impl EntityKey {
    /// Validated constructor. Both parts must be non-empty; see [`SEPARATOR`].
    pub fn new(
        hub: impl Into<String>,
        kind: EntityKind,
        id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let hub = hub.into();
        let id = id.into();
        check_hub(&hub)?;
        check_id(&id)?;
        Ok(Self { hub, kind, id })
    }

    pub fn client(hub: impl Into<String>, connection_id: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(hub, EntityKind::Client, connection_id)
    }

    pub fn group(hub: impl Into<String>, group: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(hub, EntityKind::Group, group)
    }

    pub fn user(hub: impl Into<String>, user_id: impl Into<String>) -> Result<Self, KeyError> {
        Self::new(hub, EntityKind::User, user_id)
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `hub::id`. Injective for hub names without `:` and ids without `::`.
    pub fn build(hub: &str, id: &str) -> String {
        let mut out = String::with_capacity(hub.len() + SEPARATOR.len() + id.len());
        out.push_str(hub);
        out.push_str(SEPARATOR);
        out.push_str(id);
        out
    }

    /// Inverse of [`EntityKey::build`].
    pub fn split(raw: &str) -> Result<(String, String), KeyError> {
        let (hub, id) = raw
            .split_once(SEPARATOR)
            .ok_or_else(|| KeyError::format(raw, "missing separator"))?;
        if hub.is_empty() || id.is_empty() {
            return Err(KeyError::format(raw, "empty part"));
        }
        Ok((hub.to_string(), id.to_string()))
    }

    /// The durable address of this entity: `hub::kind::id`.
    pub fn address(&self) -> String {
        let inner = format!("{}{}{}", self.kind.tag(), SEPARATOR, self.id);
        Self::build(&self.hub, &inner)
    }

    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        if parts.len() != 3 || parts[0].contains(':') {
            return Err(KeyError::format(raw, "expected hub::kind::id"));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(KeyError::format(raw, "empty part"));
        }
        let kind = EntityKind::from_tag(parts[1])
            .ok_or_else(|| KeyError::format(raw, "unknown entity kind"))?;
        Ok(Self {
            hub: parts[0].to_string(),
            kind,
            id: parts[2].to_string(),
        })
    }
}

fn check_hub(hub: &str) -> Result<(), KeyError> {
    if hub.is_empty() {
        return Err(KeyError::format(hub, "empty hub name"));
    }
    if hub.contains(':') {
        return Err(KeyError::format(hub, "hub name contains ':'"));
    }
    Ok(())
}

fn check_id(id: &str) -> Result<(), KeyError> {
    if id.is_empty() {
        return Err(KeyError::format(id, "empty entity id"));
    }
    if id.contains(SEPARATOR) {
        return Err(KeyError::format(id, "entity id contains reserved separator"));
    }
    Ok(())
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

impl FromStr for EntityKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_split_recovers_parts() {
        for (hub, id) in [("chat", "conn-1"), ("h", "x:y"), ("hub.with.dots", "a b c")] {
            let raw = EntityKey::build(hub, id);
            let (h, i) = EntityKey::split(&raw).expect("split");
            assert_eq!(h, hub);
            assert_eq!(i, id);
        }
    }

    #[test]
    fn ids_with_single_colons_stay_unambiguous() {
        let raw = EntityKey::build("a", ":b");
        assert_eq!(raw, "a:::b");
        assert_eq!(EntityKey::split(&raw).unwrap(), ("a".to_string(), ":b".to_string()));
        assert!(EntityKey::client("a:", "b").is_err());
    }

    #[test]
    fn address_round_trips_for_every_kind() {
        let keys = [
            EntityKey::client("chat", "c1").unwrap(),
            EntityKey::group("chat", "room").unwrap(),
            EntityKey::user("chat", "alice").unwrap(),
        ];
        for key in keys {
            let parsed: EntityKey = key.address().parse().expect("parse");
            assert_eq!(parsed, key);
        }
        assert_eq!(
            EntityKey::group("chat", "room").unwrap().address(),
            "chat::group::room"
        );
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for raw in ["", "chat", "chat::room", "chat::group::", "::group::x", "chat::robot::x", "a::group::b::c"] {
            assert!(
                matches!(EntityKey::parse(raw), Err(KeyError::Format { .. })),
                "{raw} should not parse"
            );
        }
    }

    #[test]
    fn separator_inside_parts_is_refused() {
        assert!(EntityKey::group("chat", "a::b").is_err());
        assert!(EntityKey::group("ch:at", "room").is_err());
        assert!(EntityKey::user("", "alice").is_err());
    }
}
