use crate::error::SyncError;
use serde::{Deserialize, Serialize};

/// Synchronizable domain categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "sites")]
    Sites,
    #[serde(rename = "assessments")]
    Assessments,
    #[serde(rename = "assessment_responses")]
    AssessmentResponses,
}

impl EntityType {
    /// All types in dependency order: referenced types before referencing
    /// ones, so a mixed bulk upload can resolve cross-type temp ids.
    pub const ALL: [EntityType; 3] = [
        EntityType::Sites,
        EntityType::Assessments,
        EntityType::AssessmentResponses,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Sites => "sites",
            EntityType::Assessments => "assessments",
            EntityType::AssessmentResponses => "assessment_responses",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SyncError> {
        match value {
            "sites" => Ok(EntityType::Sites),
            "assessments" => Ok(EntityType::Assessments),
            "assessment_responses" => Ok(EntityType::AssessmentResponses),
            other => Err(SyncError::UnknownEntityType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation recorded in the change ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SyncError> {
        match value {
            "create" => Ok(ChangeOp::Create),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            other => Err(SyncError::UnknownOperation(other.to_string())),
        }
    }
}
