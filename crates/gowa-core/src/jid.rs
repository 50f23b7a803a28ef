//! WhatsApp JID handling.
//!
//! A JID is `<user>@<server>`, optionally carrying a device part
//! (`<user>:<device>@<server>`) for multi-device addressing. Individual
//! chats come in two forms: the phone-number form (`@s.whatsapp.net`) and
//! the hidden-identifier form (`@lid`).

use std::fmt;
use std::str::FromStr;

/// Known JID servers.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const LEGACY_USER_SERVER: &str = "c.us";

/// A WhatsApp user/group/entity identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl Jid {
    /// New regular JID (user@server).
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Phone-number form for a user part.
    pub fn pn(user: impl Into<String>) -> Self {
        Self::new(user, DEFAULT_USER_SERVER)
    }

    /// Hidden-identifier form for a user part.
    pub fn lid(user: impl Into<String>) -> Self {
        Self::new(user, HIDDEN_USER_SERVER)
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    /// Hidden-identifier (`@lid`) form.
    pub fn is_hidden(&self) -> bool {
        self.server == HIDDEN_USER_SERVER
    }

    /// Individual chat: phone-number, legacy, or hidden-identifier form.
    pub fn is_individual(&self) -> bool {
        matches!(
            self.server.as_str(),
            DEFAULT_USER_SERVER | HIDDEN_USER_SERVER | LEGACY_USER_SERVER
        )
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Same user on a different server. Used when consolidating the
    /// phone-number form into the hidden-identifier form.
    pub fn with_server(&self, server: impl Into<String>) -> Self {
        Self {
            user: self.user.clone(),
            device: self.device,
            server: server.into(),
        }
    }

    /// JID without the device part.
    pub fn to_non_ad(&self) -> Self {
        Self {
            user: self.user.clone(),
            device: 0,
            server: self.server.clone(),
        }
    }

    /// Phone-number-formatted display variant (`+<digits>`), falling back
    /// to the raw user part when it is not numeric.
    pub fn display_fallback(&self) -> String {
        if !self.user.is_empty() && self.user.chars().all(|c| c.is_ascii_digit()) {
            format!("+{}", self.user)
        } else {
            self.user.clone()
        }
    }
}

/// Chat display name: explicit push-name wins, then the phone-number
/// variant, then the raw user part.
pub fn display_name(push_name: &str, jid: &Jid) -> String {
    if !push_name.is_empty() {
        return push_name.to_string();
    }
    let formatted = jid.display_fallback();
    if formatted.is_empty() {
        jid.user.clone()
    } else {
        formatted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JidParseError;

impl fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid JID format")
    }
}

impl std::error::Error for JidParseError {}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '@');
        let head = parts.next().unwrap_or_default();
        let server = match parts.next() {
            Some(server) => server,
            // Server-only JID ("g.us").
            None => {
                return Ok(Self {
                    user: String::new(),
                    device: 0,
                    server: head.to_string(),
                });
            }
        };
        if server.is_empty() {
            return Err(JidParseError);
        }

        // Strip an agent suffix ("user.1") and parse a device part ("user:3").
        let head = head.split('.').next().unwrap_or_default();
        let (user, device) = match head.split_once(':') {
            Some((user, device)) => {
                let device = device.parse().map_err(|_| JidParseError)?;
                (user, device)
            }
            None => (head, 0),
        };

        Ok(Self {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::from_str(&s).map_err(serde::de::Error::custom)
    }
}
