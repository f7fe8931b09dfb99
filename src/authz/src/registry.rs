//! Resource registry
//!
//! Canonical map of resource types to the operations they support. Built once
//! at startup and shared read-only (`Arc<ResourceRegistry>`) afterwards.

use crate::compiler::sets::{OpSet, SortedOps};
use crate::error::{AuthzError, Result};
use crate::types::{ResourceType, StandardOp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Operations folded into the `manage` composite on every standard resource
const MANAGE: [StandardOp; 6] = [
    StandardOp::Create,
    StandardOp::Read,
    StandardOp::Update,
    StandardOp::Delete,
    StandardOp::Export,
    StandardOp::Import,
];

/// Resource-specific operation outside the standard bit space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedOperation {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

/// Registration record supplied at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: ResourceType,
    pub standard_ops: Vec<StandardOp>,
    #[serde(default)]
    pub extended_ops: Vec<ExtendedOperation>,
    #[serde(default)]
    pub composites: BTreeMap<String, Vec<StandardOp>>,
    pub default_op: StandardOp,
    /// Standard or extended operation names gated by an approval workflow
    #[serde(default)]
    pub approval_required: Vec<String>,
}

impl ResourceDefinition {
    /// Start a definition; the default operation is `read`
    pub fn new(name: impl Into<String>, standard_ops: &[StandardOp]) -> Self {
        Self {
            name: name.into(),
            standard_ops: standard_ops.to_vec(),
            extended_ops: Vec::new(),
            composites: BTreeMap::new(),
            default_op: StandardOp::Read,
            approval_required: Vec::new(),
        }
    }

    pub fn with_extended(
        mut self,
        name: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.extended_ops.push(ExtendedOperation {
            name: name.into(),
            display_name: display_name.into(),
            description: description.into(),
        });
        self
    }

    pub fn with_composite(mut self, name: impl Into<String>, ops: &[StandardOp]) -> Self {
        self.composites.insert(name.into(), ops.to_vec());
        self
    }

    /// Add `manage` as every `MANAGE` operation this resource supports
    pub fn with_manage_composite(self) -> Self {
        let ops: Vec<StandardOp> = MANAGE
            .iter()
            .copied()
            .filter(|op| self.standard_ops.contains(op))
            .collect();
        self.with_composite("manage", &ops)
    }

    pub fn with_default(mut self, op: StandardOp) -> Self {
        self.default_op = op;
        self
    }

    pub fn requiring_approval(mut self, op: impl Into<String>) -> Self {
        self.approval_required.push(op.into());
        self
    }
}

/// Validated, lookup-optimised registry entry
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: ResourceType,
    pub supported: OpSet,
    pub extended: SortedOps,
    pub extended_details: BTreeMap<String, ExtendedOperation>,
    pub composites: BTreeMap<String, OpSet>,
    pub default_op: StandardOp,
    pub approval_required: BTreeSet<String>,
}

impl ResourceRecord {
    fn from_definition(def: ResourceDefinition) -> Result<Self> {
        if def.name.is_empty() {
            return Err(AuthzError::InvalidConfig("resource name is empty".into()));
        }

        let supported: OpSet = def.standard_ops.iter().copied().collect();
        if !supported.contains(def.default_op) {
            return Err(AuthzError::InvalidConfig(format!(
                "resource {}: default operation {} is not supported",
                def.name, def.default_op
            )));
        }

        let mut extended = SortedOps::new();
        let mut extended_details = BTreeMap::new();
        for op in def.extended_ops {
            if StandardOp::parse(&op.name).is_some() {
                return Err(AuthzError::InvalidConfig(format!(
                    "resource {}: extended operation {} shadows a standard operation",
                    def.name, op.name
                )));
            }
            if !extended.insert(op.name.clone()) {
                return Err(AuthzError::InvalidConfig(format!(
                    "resource {}: duplicate extended operation {}",
                    def.name, op.name
                )));
            }
            extended_details.insert(op.name.clone(), op);
        }

        let mut composites = BTreeMap::new();
        for (name, ops) in def.composites {
            let bits: OpSet = ops.into_iter().collect();
            if !bits.is_subset_of(supported) {
                return Err(AuthzError::InvalidConfig(format!(
                    "resource {}: composite {} uses unsupported operations",
                    def.name, name
                )));
            }
            if extended.contains(&name) || StandardOp::parse(&name).is_some() {
                return Err(AuthzError::InvalidConfig(format!(
                    "resource {}: composite {} collides with an operation name",
                    def.name, name
                )));
            }
            composites.insert(name, bits);
        }

        let mut approval_required = BTreeSet::new();
        for op in def.approval_required {
            let known = match StandardOp::parse(&op) {
                Some(standard) => supported.contains(standard),
                None => extended.contains(&op),
            };
            if !known {
                return Err(AuthzError::InvalidConfig(format!(
                    "resource {}: approval required for unsupported operation {}",
                    def.name, op
                )));
            }
            approval_required.insert(op);
        }

        Ok(Self {
            name: def.name,
            supported,
            extended,
            extended_details,
            composites,
            default_op: def.default_op,
            approval_required,
        })
    }

    /// Whether `action` (standard or extended name) is supported
    pub fn supports_action(&self, action: &str) -> bool {
        match StandardOp::parse(action) {
            Some(op) => self.supported.contains(op),
            None => self.extended.contains(action),
        }
    }
}

/// Process-wide resource registry, immutable after construction
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: HashMap<ResourceType, ResourceRecord>,
}

impl ResourceRegistry {
    /// Build a registry from registration records
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for duplicate resources or inconsistent
    /// operation declarations.
    pub fn new(definitions: impl IntoIterator<Item = ResourceDefinition>) -> Result<Self> {
        let mut resources = HashMap::new();
        for def in definitions {
            let record = ResourceRecord::from_definition(def)?;
            if resources.contains_key(&record.name) {
                return Err(AuthzError::InvalidConfig(format!(
                    "duplicate resource registration: {}",
                    record.name
                )));
            }
            resources.insert(record.name.clone(), record);
        }
        Ok(Self { resources })
    }

    /// Exact-match lookup
    pub fn get_resource(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn supports_standard(&self, name: &str, op: StandardOp) -> bool {
        self.get_resource(name)
            .map(|r| r.supported.contains(op))
            .unwrap_or(false)
    }

    pub fn supports_extended(&self, name: &str, op_name: &str) -> bool {
        self.get_resource(name)
            .map(|r| r.extended.contains(op_name))
            .unwrap_or(false)
    }

    /// Bitfield of a composite operation on a resource
    pub fn expand_composite(&self, name: &str, composite_name: &str) -> Option<OpSet> {
        self.get_resource(name)?.composites.get(composite_name).copied()
    }

    pub fn requires_approval(&self, name: &str, op_name: &str) -> bool {
        self.get_resource(name)
            .map(|r| r.approval_required.contains(op_name))
            .unwrap_or(false)
    }

    pub fn default_operation(&self, name: &str) -> Option<StandardOp> {
        self.get_resource(name).map(|r| r.default_op)
    }

    /// Registered resource names, sorted
    pub fn resource_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Registry of the transport management platform's resource types
    pub fn standard() -> Result<Self> {
        use StandardOp::*;

        let crud_list = [Create, Read, Update, Delete, List];
        let master_data = [Create, Read, Update, Delete, List, Export, Import, Archive, Restore];

        let definitions = vec![
            ResourceDefinition::new(
                "shipment",
                &[
                    Create, Read, Update, Delete, List, Export, Import, Archive, Restore, Submit,
                    Assign, Duplicate,
                ],
            )
            .with_extended("transfer_ownership", "Transfer Ownership", "Move a shipment to another owner")
            .with_extended("split", "Split Shipment", "Split a shipment into multiple moves")
            .with_extended("ready_to_bill", "Mark Ready to Bill", "Flag a delivered shipment for billing")
            .with_manage_composite(),
            ResourceDefinition::new("shipment_move", &crud_list)
                .with_extended("reassign_worker", "Reassign Worker", "Change the worker on a move")
                .with_manage_composite(),
            ResourceDefinition::new("assignment", &[Create, Read, Update, Delete, List, Assign])
                .with_manage_composite(),
            ResourceDefinition::new(
                "billing_queue",
                &[Read, Update, List, Export, Approve, Reject],
            )
            .with_extended("bulk_transfer", "Bulk Transfer", "Transfer many shipments into the queue")
            .with_extended("release_to_billing", "Release to Billing", "Release queued items for invoicing")
            .requiring_approval("release_to_billing")
            .with_manage_composite(),
            ResourceDefinition::new("billing_control", &[Read, Update]),
            ResourceDefinition::new(
                "invoice",
                &[Create, Read, Update, Delete, List, Export, Approve, Reject, Submit, Archive],
            )
            .requiring_approval("approve")
            .with_manage_composite(),
            ResourceDefinition::new("customer", &master_data).with_manage_composite(),
            ResourceDefinition::new("location", &master_data).with_manage_composite(),
            ResourceDefinition::new("commodity", &master_data).with_manage_composite(),
            ResourceDefinition::new("hazardous_material", &master_data).with_manage_composite(),
            ResourceDefinition::new("worker", &master_data)
                .with_extended("manage_pto", "Manage PTO", "Approve or reject worker time off")
                .with_manage_composite(),
            ResourceDefinition::new("tractor", &master_data).with_manage_composite(),
            ResourceDefinition::new("trailer", &master_data).with_manage_composite(),
            ResourceDefinition::new("equipment_type", &master_data).with_manage_composite(),
            ResourceDefinition::new("fleet_code", &master_data).with_manage_composite(),
            ResourceDefinition::new("user", &[Create, Read, Update, Delete, List, Export, Import, Assign])
                .with_extended("impersonate", "Impersonate", "Act on behalf of another user")
                .requiring_approval("impersonate")
                .with_manage_composite(),
            ResourceDefinition::new("role", &[Create, Read, Update, Delete, List, Assign])
                .with_manage_composite(),
            ResourceDefinition::new("organization", &[Read, Update, List]),
            ResourceDefinition::new("business_unit", &[Read, Update]),
            ResourceDefinition::new("report", &[Create, Read, List, Export, Share])
                .with_default(List),
            ResourceDefinition::new("audit_log", &[Read, List, Export]).with_default(List),
            ResourceDefinition::new(
                "table_configuration",
                &[Create, Read, Update, Delete, List, Share, Duplicate],
            )
            .with_extended("manage_defaults", "Manage Defaults", "Edit organization-wide default layouts")
            .with_manage_composite(),
            ResourceDefinition::new("integration", &[Create, Read, Update, Delete, List])
                .with_manage_composite(),
            ResourceDefinition::new("setting", &[Read, Update]),
            ResourceDefinition::new("document_template", &[Create, Read, Update, Delete, List, Duplicate])
                .with_manage_composite(),
        ];

        Self::new(definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_builds() {
        let registry = ResourceRegistry::standard().unwrap();
        assert!(registry.contains("shipment"));
        assert!(registry.contains("role"));
        assert!(registry.contains("billing_control"));
        assert!(!registry.contains("not_a_real_resource"));
    }

    #[test]
    fn test_supports_lookups() {
        let registry = ResourceRegistry::standard().unwrap();

        assert!(registry.supports_standard("shipment", StandardOp::Delete));
        assert!(!registry.supports_standard("billing_control", StandardOp::Delete));
        assert!(!registry.supports_standard("nope", StandardOp::Read));

        assert!(registry.supports_extended("billing_queue", "bulk_transfer"));
        assert!(!registry.supports_extended("shipment", "bulk_transfer"));
    }

    #[test]
    fn test_expand_composite() {
        let registry = ResourceRegistry::standard().unwrap();

        let manage = registry.expand_composite("shipment", "manage").unwrap();
        assert_eq!(manage.bits(), 0x01 | 0x02 | 0x04 | 0x08 | 0x20 | 0x40);

        // role has no export/import, so manage narrows to what it supports
        let role_manage = registry.expand_composite("role", "manage").unwrap();
        assert_eq!(role_manage.bits(), 0x0f);

        assert!(registry.expand_composite("shipment", "bogus").is_none());
        assert!(registry.expand_composite("bogus", "manage").is_none());
    }

    #[test]
    fn test_approval_and_default_lookups() {
        let registry = ResourceRegistry::standard().unwrap();

        assert!(registry.requires_approval("billing_queue", "release_to_billing"));
        assert!(!registry.requires_approval("billing_queue", "bulk_transfer"));
        assert_eq!(registry.default_operation("report"), Some(StandardOp::List));
        assert_eq!(registry.default_operation("missing"), None);
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let defs = vec![
            ResourceDefinition::new("shipment", &[StandardOp::Read]),
            ResourceDefinition::new("shipment", &[StandardOp::Read]),
        ];
        let err = ResourceRegistry::new(defs).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidConfig(_)));
    }

    #[test]
    fn test_composite_outside_supported_rejected() {
        let def = ResourceDefinition::new("memo", &[StandardOp::Read])
            .with_composite("edit", &[StandardOp::Read, StandardOp::Update]);
        assert!(ResourceRegistry::new(vec![def]).is_err());
    }

    #[test]
    fn test_default_must_be_supported() {
        let def = ResourceDefinition::new("memo", &[StandardOp::Create])
            .with_default(StandardOp::Read);
        assert!(ResourceRegistry::new(vec![def]).is_err());
    }

    #[test]
    fn test_extended_cannot_shadow_standard() {
        let def = ResourceDefinition::new("memo", &[StandardOp::Read])
            .with_extended("read", "Read", "dup");
        assert!(ResourceRegistry::new(vec![def]).is_err());
    }
}
