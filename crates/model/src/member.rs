use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Membership programme a user belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    Vip,
    Pro,
}

impl MemberType {
    pub fn code(self) -> i16 {
        match self {
            MemberType::Vip => 1,
            MemberType::Pro => 2,
        }
    }
}

impl TryFrom<i16> for MemberType {
    type Error = ModelError;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MemberType::Vip),
            2 => Ok(MemberType::Pro),
            _ => Err(ModelError::UnknownCode {
                kind: "member type",
                code,
            }),
        }
    }
}

/// Member — current tier of a user. Users without a record are non-members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: i64,
    pub user_id: i64,
    pub member_type: MemberType,
    /// Rank inside the programme, e.g. 1, 2, 3.
    pub level: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
