//! Core permission types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique user identifier
pub type UserId = String;

/// Unique organization (tenant) identifier
pub type OrganizationId = String;

/// Unique business unit identifier
pub type BusinessUnitId = String;

/// Unique policy identifier
pub type PolicyId = String;

/// Unique role identifier
pub type RoleId = String;

/// Unique group identifier
pub type GroupId = String;

/// Registered resource type name (e.g. "shipment")
pub type ResourceType = String;

/// Standard operations with stable bit positions.
///
/// The discriminant is the bit index inside the 32-bit standard field.
/// Reordering breaks cached manifests and requires a version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardOp {
    Create = 0,
    Read = 1,
    Update = 2,
    Delete = 3,
    List = 4,
    Export = 5,
    Import = 6,
    Approve = 7,
    Reject = 8,
    Archive = 9,
    Restore = 10,
    Submit = 11,
    Assign = 12,
    Share = 13,
    Duplicate = 14,
}

impl StandardOp {
    /// Every standard operation in bit order
    pub const ALL: [StandardOp; 15] = [
        StandardOp::Create,
        StandardOp::Read,
        StandardOp::Update,
        StandardOp::Delete,
        StandardOp::List,
        StandardOp::Export,
        StandardOp::Import,
        StandardOp::Approve,
        StandardOp::Reject,
        StandardOp::Archive,
        StandardOp::Restore,
        StandardOp::Submit,
        StandardOp::Assign,
        StandardOp::Share,
        StandardOp::Duplicate,
    ];

    /// Bit mask for this operation
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Wire name of the operation
    pub const fn as_str(self) -> &'static str {
        match self {
            StandardOp::Create => "create",
            StandardOp::Read => "read",
            StandardOp::Update => "update",
            StandardOp::Delete => "delete",
            StandardOp::List => "list",
            StandardOp::Export => "export",
            StandardOp::Import => "import",
            StandardOp::Approve => "approve",
            StandardOp::Reject => "reject",
            StandardOp::Archive => "archive",
            StandardOp::Restore => "restore",
            StandardOp::Submit => "submit",
            StandardOp::Assign => "assign",
            StandardOp::Share => "share",
            StandardOp::Duplicate => "duplicate",
        }
    }

    /// Parse a wire name, `None` for extended operation names
    pub fn parse(name: &str) -> Option<Self> {
        StandardOp::ALL.iter().copied().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for StandardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StandardOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StandardOp::parse(s).ok_or_else(|| format!("unknown standard operation: {}", s))
    }
}

/// Breadth of records a permission applies to, least permissive first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataScope {
    #[default]
    #[serde(rename = "own")]
    Own,
    #[serde(rename = "organization")]
    Organization,
    #[serde(rename = "businessUnit", alias = "business_unit")]
    BusinessUnit,
    #[serde(rename = "all")]
    All,
}

impl DataScope {
    /// Most permissive of the two scopes
    pub fn widest(self, other: DataScope) -> DataScope {
        self.max(other)
    }
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataScope::Own => "own",
            DataScope::Organization => "organization",
            DataScope::BusinessUnit => "business_unit",
            DataScope::All => "all",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_bit_layout() {
        assert_eq!(StandardOp::Create.bit(), 0x01);
        assert_eq!(StandardOp::Read.bit(), 0x02);
        assert_eq!(StandardOp::Update.bit(), 0x04);
        assert_eq!(StandardOp::Delete.bit(), 0x08);
        assert_eq!(StandardOp::List.bit(), 0x10);
        assert_eq!(StandardOp::Export.bit(), 0x20);
        assert_eq!(StandardOp::Import.bit(), 0x40);
        assert_eq!(StandardOp::Approve.bit(), 0x80);
        assert_eq!(StandardOp::Reject.bit(), 0x100);
        assert_eq!(StandardOp::Archive.bit(), 0x200);
        assert_eq!(StandardOp::Restore.bit(), 0x400);
        assert_eq!(StandardOp::Duplicate.bit(), 0x4000);
    }

    #[test]
    fn test_parse_round_trips_names() {
        for op in StandardOp::ALL {
            assert_eq!(StandardOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(StandardOp::parse("bulk_transfer"), None);
        assert!("manage".parse::<StandardOp>().is_err());
    }

    #[test]
    fn test_data_scope_ordering() {
        assert!(DataScope::Own < DataScope::Organization);
        assert!(DataScope::Organization < DataScope::BusinessUnit);
        assert!(DataScope::BusinessUnit < DataScope::All);
        assert_eq!(DataScope::Own.widest(DataScope::All), DataScope::All);
    }

    #[test]
    fn test_data_scope_wire_names() {
        let json = serde_json::to_string(&DataScope::BusinessUnit).unwrap();
        assert_eq!(json, "\"businessUnit\"");

        let parsed: DataScope = serde_json::from_str("\"business_unit\"").unwrap();
        assert_eq!(parsed, DataScope::BusinessUnit);
    }
}
