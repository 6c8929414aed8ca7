use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(
    /// Identifier generated on the device before the server has seen the record.
    ClientId
);
typed_id!(
    /// Permanent identifier assigned by the server.
    ServerId
);
typed_id!(UserId);

impl ClientId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Two-phase identity of a cached expense: a provisional key minted locally and
/// the authoritative key once the server has confirmed the create.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpenseKey {
    pub provisional: Option<ClientId>,
    pub authoritative: Option<ServerId>,
}

impl ExpenseKey {
    pub fn provisional(client_id: ClientId) -> Self {
        Self {
            provisional: Some(client_id),
            authoritative: None,
        }
    }

    pub fn confirmed(server_id: ServerId, client_id: Option<ClientId>) -> Self {
        Self {
            provisional: client_id,
            authoritative: Some(server_id),
        }
    }

    /// The id every other component refers to: the server id once known,
    /// otherwise the provisional one.
    pub fn current(&self) -> &str {
        match (&self.authoritative, &self.provisional) {
            (Some(server), _) => server.as_str(),
            (None, Some(client)) => client.as_str(),
            (None, None) => "",
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.authoritative.is_some()
    }

    /// Replace the provisional identity with the authoritative one in a single step.
    pub fn confirm(&mut self, server_id: ServerId) {
        self.authoritative = Some(server_id);
    }

    pub fn matches(&self, other: &Self) -> bool {
        let same_current = !self.current().is_empty() && self.current() == other.current();
        let same_client = match (&self.provisional, &other.provisional) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        same_current || same_client
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Debit,
    Credit,
}

impl EntryKind {
    /// Signed effect of an entry of this kind on the running balance.
    pub fn signed(self, amount: f64) -> f64 {
        match self {
            EntryKind::Debit => -amount,
            EntryKind::Credit => amount,
        }
    }
}

/// Expense as the server sends it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub amount: f64,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub details: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub category: String,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// One page of the expense listing endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpensePage {
    pub expenses: Vec<ExpenseRecord>,
    #[serde(default)]
    pub total_balance: f64,
}

/// One row of the local cache.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedExpense {
    pub key: ExpenseKey,
    pub amount: f64,
    pub date: DateTime<Utc>,
    pub details: String,
    pub kind: EntryKind,
    pub category: String,
    pub is_synced: bool,
}

impl CachedExpense {
    /// Build an unsynced row for an expense created on this device.
    pub fn pending(
        client_id: ClientId,
        amount: f64,
        date: DateTime<Utc>,
        kind: EntryKind,
        category: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            key: ExpenseKey::provisional(client_id),
            amount,
            date,
            details: details.into(),
            kind,
            category: category.into(),
            is_synced: false,
        }
    }

    pub fn id(&self) -> &str {
        self.key.current()
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.key.provisional.as_ref()
    }
}

impl From<ExpenseRecord> for CachedExpense {
    fn from(record: ExpenseRecord) -> Self {
        Self {
            key: ExpenseKey::confirmed(ServerId(record.id), record.client_id.map(ClientId)),
            amount: record.amount,
            date: record.date,
            details: record.details,
            kind: record.kind,
            category: record.category,
            is_synced: true,
        }
    }
}

// Redact debug output because this can contain sensitive user-provided data.
impl fmt::Debug for CachedExpense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedExpense")
            .field("key", &self.key)
            .field("date", &self.date)
            .field("kind", &self.kind)
            .field("details_present", &!self.details.is_empty())
            .field("is_synced", &self.is_synced)
            .finish()
    }
}
