//! Common types used across Lectern

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// Account ID wrapper (the quota-bearing subscriber)
    AccountId
);
id_wrapper!(
    /// Organization ID wrapper
    OrgId
);
id_wrapper!(
    /// Accounting period ID wrapper
    PeriodId
);
id_wrapper!(
    /// End-user on whose behalf usage is metered
    SubjectId
);

/// Role name that never consumes a seat
pub const OWNER_ROLE: &str = "owner";

/// Check whether a binding role is exempt from seat counting
pub fn is_owner_role(role: &str) -> bool {
    role.eq_ignore_ascii_case(OWNER_ROLE)
}

// =============================================================================
// Enums
// =============================================================================

/// Stored status of an accounting period
///
/// The stored value alone never decides usability: an `active` row whose
/// `end_time` has passed is treated as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Active,
    Expired,
    Cancelled,
}

impl std::fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for PeriodStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid period status: {}", s)),
        }
    }
}

/// Raw usage unit reported by a metered feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Seconds,
    Characters,
    Images,
    Minutes,
}

/// Exact conversion factor from a raw unit into quota-seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multiplier {
    pub numerator: i64,
    pub denominator: i64,
}

impl Multiplier {
    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Approximate value, for display only
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

impl UnitType {
    /// All recognized unit types
    pub const ALL: [UnitType; 4] = [Self::Seconds, Self::Characters, Self::Images, Self::Minutes];

    /// Multiplier against the canonical quota unit
    /// seconds (1) / characters (0.1) / images (10) / minutes (60)
    pub fn multiplier(&self) -> Multiplier {
        match self {
            Self::Seconds => Multiplier::new(1, 1),
            Self::Characters => Multiplier::new(1, 10),
            Self::Images => Multiplier::new(10, 1),
            Self::Minutes => Multiplier::new(60, 1),
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seconds => write!(f, "seconds"),
            Self::Characters => write!(f, "characters"),
            Self::Images => write!(f, "images"),
            Self::Minutes => write!(f, "minutes"),
        }
    }
}

impl std::str::FromStr for UnitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "seconds" => Ok(Self::Seconds),
            "characters" => Ok(Self::Characters),
            "images" => Ok(Self::Images),
            "minutes" => Ok(Self::Minutes),
            _ => Err(format!("Unknown unit type: {}", s)),
        }
    }
}
