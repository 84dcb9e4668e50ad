//! Contract registry: a bidirectional mapping between runtime types and
//! stable string identifiers.
//!
//! Checkpoint keys and persisted headers use contract names rather than Rust
//! type names, so renaming or moving a type does not invalidate history. The
//! default registry is an explicit table built once at startup.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::error::ContractError;

/// Runtime identity of a type that can carry a contract name.
///
/// Pairs the [`TypeId`] used for lookups with the Rust type name used in
/// diagnostics.
#[derive(Clone, Copy)]
pub struct ContractType {
    id: TypeId,
    name: &'static str,
}

impl ContractType {
    /// The contract identity of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying [`TypeId`].
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The Rust type name, for diagnostics only.
    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ContractType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContractType {}

impl fmt::Debug for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Maps runtime types to stable contract names and back.
///
/// Lookups are strict: an unregistered type is a configuration error, because
/// checkpoint keys depend on total, consistent coverage.
pub trait ContractsRegistry: Send + Sync {
    /// The contract name registered for `ty`.
    ///
    /// # Errors
    ///
    /// [`ContractError::Unregistered`] if `ty` has no contract name.
    fn contract_name(&self, ty: ContractType) -> Result<&str, ContractError>;

    /// The type registered under `name`.
    ///
    /// # Errors
    ///
    /// [`ContractError::UnknownName`] if no type carries `name`.
    fn contract_type(&self, name: &str) -> Result<TypeId, ContractError>;
}

impl dyn ContractsRegistry + '_ {
    /// Typed shorthand for [`ContractsRegistry::contract_name`].
    pub fn name_of<T: ?Sized + 'static>(&self) -> Result<&str, ContractError> {
        self.contract_name(ContractType::of::<T>())
    }
}

/// The default registry: an explicit `type -> name` table built at startup.
///
/// # Examples
///
/// ```
/// use ses::{ContractType, ContractsRegistry, StaticContractsRegistry};
///
/// struct BillingPooler;
///
/// let registry = StaticContractsRegistry::builder()
///     .register::<BillingPooler>("billing")
///     .build()
///     .expect("no duplicates");
///
/// let name = registry
///     .contract_name(ContractType::of::<BillingPooler>())
///     .unwrap();
/// assert_eq!(name, "billing");
/// ```
#[derive(Debug, Default)]
pub struct StaticContractsRegistry {
    names: HashMap<TypeId, String>,
    types: HashMap<String, TypeId>,
}

impl StaticContractsRegistry {
    /// Start building a registry.
    pub fn builder() -> StaticContractsRegistryBuilder {
        StaticContractsRegistryBuilder::default()
    }

    /// Number of registered contracts.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no contracts are registered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl ContractsRegistry for StaticContractsRegistry {
    fn contract_name(&self, ty: ContractType) -> Result<&str, ContractError> {
        self.names
            .get(&ty.id())
            .map(String::as_str)
            .ok_or(ContractError::Unregistered {
                type_name: ty.type_name(),
            })
    }

    fn contract_type(&self, name: &str) -> Result<TypeId, ContractError> {
        self.types
            .get(name)
            .copied()
            .ok_or_else(|| ContractError::UnknownName(name.to_owned()))
    }
}

/// Collects `(type, name)` pairs for a [`StaticContractsRegistry`].
#[derive(Debug, Default)]
pub struct StaticContractsRegistryBuilder {
    entries: Vec<(ContractType, String)>,
}

impl StaticContractsRegistryBuilder {
    /// Register `T` under `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - Stable contract name. Renaming it orphans checkpoint rows
    ///   stored under the old name.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn register<T: ?Sized + 'static>(mut self, name: impl Into<String>) -> Self {
        self.entries.push((ContractType::of::<T>(), name.into()));
        self
    }

    /// Build the registry, validating that names and types are unique.
    ///
    /// # Errors
    ///
    /// [`ContractError::DuplicateType`] or [`ContractError::DuplicateName`]
    /// if the table is not a bijection.
    pub fn build(self) -> Result<StaticContractsRegistry, ContractError> {
        let mut registry = StaticContractsRegistry::default();
        for (ty, name) in self.entries {
            if registry.names.contains_key(&ty.id()) {
                return Err(ContractError::DuplicateType(ty.type_name()));
            }
            if registry.types.contains_key(&name) {
                return Err(ContractError::DuplicateName(name));
            }
            registry.types.insert(name.clone(), ty.id());
            registry.names.insert(ty.id(), name);
        }
        Ok(registry)
    }
}
