//! Option cache: named, typed, possibly per-port-scoped configuration
//! values.

use tracing::warn;

use crate::error::{Result, TeamError};
use crate::port::Provenance;

/// Value type tag of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    U32,
    String,
    Binary,
    Bool,
}

/// Typed option value.
///
/// The type tag of an option is immutable once first observed; accessing
/// a value through the wrong variant fails rather than coercing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    U32(u32),
    Str(String),
    Bin(Vec<u8>),
    Bool(bool),
}

impl OptionValue {
    /// The type tag of this value.
    pub fn kind(&self) -> OptionType {
        match self {
            OptionValue::U32(_) => OptionType::U32,
            OptionValue::Str(_) => OptionType::String,
            OptionValue::Bin(_) => OptionType::Binary,
            OptionValue::Bool(_) => OptionType::Bool,
        }
    }

    /// Length of the stored value in bytes (string length excludes the
    /// wire NUL terminator).
    pub fn len(&self) -> usize {
        match self {
            OptionValue::U32(_) => 4,
            OptionValue::Str(s) => s.len(),
            OptionValue::Bin(b) => b.len(),
            OptionValue::Bool(_) => 1,
        }
    }

    /// Check whether the stored value is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Addressing scope of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionScope {
    /// Device-global option.
    Global,
    /// Option owned by one port, keyed by the port's interface index.
    Port(u32),
}

impl OptionScope {
    /// The owning port's interface index, if per-port.
    pub fn port_ifindex(self) -> Option<u32> {
        match self {
            OptionScope::Global => None,
            OptionScope::Port(ifindex) => Some(ifindex),
        }
    }
}

/// One cached option.
#[derive(Debug, Clone)]
pub struct TeamOption {
    name: String,
    scope: OptionScope,
    value: OptionValue,
    changed: bool,
    removed: bool,
}

impl TeamOption {
    /// Option name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Addressing scope.
    pub fn scope(&self) -> OptionScope {
        self.scope
    }

    /// The owning port's interface index, if per-port.
    pub fn port_ifindex(&self) -> Option<u32> {
        self.scope.port_ifindex()
    }

    /// Value type tag.
    pub fn option_type(&self) -> OptionType {
        self.value.kind()
    }

    /// The stored value.
    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    /// Value length in bytes.
    pub fn value_len(&self) -> usize {
        self.value.len()
    }

    /// Typed access to a u32 value.
    pub fn value_u32(&self) -> Result<u32> {
        match &self.value {
            OptionValue::U32(v) => Ok(*v),
            _ => Err(self.type_mismatch()),
        }
    }

    /// Typed access to a string value.
    pub fn value_str(&self) -> Result<&str> {
        match &self.value {
            OptionValue::Str(v) => Ok(v),
            _ => Err(self.type_mismatch()),
        }
    }

    /// Typed access to a binary value.
    pub fn value_bin(&self) -> Result<&[u8]> {
        match &self.value {
            OptionValue::Bin(v) => Ok(v),
            _ => Err(self.type_mismatch()),
        }
    }

    /// Typed access to a boolean value.
    pub fn value_bool(&self) -> Result<bool> {
        match &self.value {
            OptionValue::Bool(v) => Ok(*v),
            _ => Err(self.type_mismatch()),
        }
    }

    /// Whether this option changed in the most recent cycle that touched it.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Whether this option was withdrawn this cycle (tombstone).
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    fn type_mismatch(&self) -> TeamError {
        TeamError::OptionTypeMismatch {
            name: self.name.clone(),
        }
    }
}

/// Decoded fields of one option-list record.
#[derive(Debug, Clone)]
pub struct OptionUpdate {
    pub name: String,
    pub scope: OptionScope,
    pub value: OptionValue,
    /// Kernel-reported explicit withdrawal.
    pub removed: bool,
}

/// Insertion-ordered cache of options, keyed by name + scope.
#[derive(Debug, Default)]
pub struct OptionCache {
    options: Vec<TeamOption>,
}

impl OptionCache {
    /// Look up an option by exact name + scope.
    pub fn get(&self, name: &str, scope: OptionScope) -> Option<&TeamOption> {
        self.options
            .iter()
            .find(|o| o.name == name && o.scope == scope)
    }

    /// Look up an option by name alone (first match in insertion order).
    pub fn get_by_name(&self, name: &str) -> Option<&TeamOption> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Resolve name + scope with the scope-mismatch distinction: a miss on
    /// the exact scope while the name exists in the other scope is a scope
    /// error, a fully unknown name is a lookup miss.
    pub fn resolve(&self, name: &str, scope: OptionScope) -> Result<&TeamOption> {
        if let Some(option) = self.get(name, scope) {
            return Ok(option);
        }
        if self.options.iter().any(|o| o.name == name) {
            return Err(TeamError::OptionScopeMismatch {
                name: name.to_string(),
            });
        }
        Err(TeamError::NotFound(name.to_string()))
    }

    /// Iterate options in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TeamOption> {
        self.options.iter()
    }

    /// Number of cached options (tombstones included).
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Ingest one decoded option list. Returns true if any option was
    /// inserted, value-changed, or withdrawn.
    ///
    /// A record that would change the type of an already-observed option
    /// violates the type-immutability invariant and is skipped.
    pub fn apply(&mut self, updates: &[OptionUpdate], provenance: Provenance) -> bool {
        let mut any_changed = false;

        for update in updates {
            if update.removed {
                if let Some(opt) = self
                    .options
                    .iter_mut()
                    .find(|o| o.name == update.name && o.scope == update.scope)
                    && !opt.removed
                {
                    opt.removed = true;
                    opt.changed = true;
                    any_changed = true;
                }
                continue;
            }

            match self
                .options
                .iter_mut()
                .find(|o| o.name == update.name && o.scope == update.scope)
            {
                Some(opt) => {
                    if opt.value.kind() != update.value.kind() {
                        warn!(
                            option = %update.name,
                            "kernel changed option type, skipping record"
                        );
                        continue;
                    }
                    opt.changed = false;
                    if opt.removed {
                        opt.removed = false;
                        opt.changed = true;
                    }
                    if opt.value != update.value {
                        opt.value = update.value.clone();
                        opt.changed = true;
                    }
                    any_changed |= opt.changed;
                }
                None => {
                    self.options.push(TeamOption {
                        name: update.name.clone(),
                        scope: update.scope,
                        value: update.value.clone(),
                        changed: true,
                        removed: false,
                    });
                    any_changed = true;
                }
            }
        }

        if provenance == Provenance::Snapshot {
            for opt in &mut self.options {
                let present = updates
                    .iter()
                    .any(|u| !u.removed && u.name == opt.name && u.scope == opt.scope);
                if !present && !opt.removed {
                    opt.removed = true;
                    opt.changed = true;
                    any_changed = true;
                }
            }
        }

        any_changed
    }

    /// Tombstone all options owned by a removed port. Returns true if any
    /// live option was marked.
    pub fn mark_port_removed(&mut self, ifindex: u32) -> bool {
        let mut marked = false;
        for opt in &mut self.options {
            if opt.scope == OptionScope::Port(ifindex) && !opt.removed {
                opt.removed = true;
                opt.changed = true;
                marked = true;
            }
        }
        marked
    }

    /// Drop tombstoned options after their dispatch cycle.
    pub fn purge_removed(&mut self) {
        self.options.retain(|o| !o.removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str, scope: OptionScope, value: OptionValue) -> OptionUpdate {
        OptionUpdate {
            name: name.to_string(),
            scope,
            value,
            removed: false,
        }
    }

    #[test]
    fn test_insert_and_diff() {
        let mut cache = OptionCache::default();
        let mode = update("mode", OptionScope::Global, OptionValue::Str("roundrobin".into()));
        assert!(cache.apply(std::slice::from_ref(&mode), Provenance::Delta));
        assert!(cache.get("mode", OptionScope::Global).unwrap().is_changed());

        // Same value again: quiet.
        assert!(!cache.apply(std::slice::from_ref(&mode), Provenance::Delta));
        assert!(!cache.get("mode", OptionScope::Global).unwrap().is_changed());

        // New value: changed.
        let mode2 = update("mode", OptionScope::Global, OptionValue::Str("broadcast".into()));
        assert!(cache.apply(&[mode2], Provenance::Delta));
        let opt = cache.get("mode", OptionScope::Global).unwrap();
        assert!(opt.is_changed());
        assert_eq!(opt.value_str().unwrap(), "broadcast");
    }

    #[test]
    fn test_type_immutable_record_skipped() {
        let mut cache = OptionCache::default();
        cache.apply(
            &[update("mode", OptionScope::Global, OptionValue::Str("rr".into()))],
            Provenance::Delta,
        );
        // A u32 record for the same option must not overwrite the string.
        assert!(!cache.apply(
            &[update("mode", OptionScope::Global, OptionValue::U32(1))],
            Provenance::Delta,
        ));
        let opt = cache.get("mode", OptionScope::Global).unwrap();
        assert_eq!(opt.option_type(), OptionType::String);
    }

    #[test]
    fn test_typed_access_rejects_cross_type() {
        let mut cache = OptionCache::default();
        cache.apply(
            &[update("mode", OptionScope::Global, OptionValue::Str("rr".into()))],
            Provenance::Delta,
        );
        let opt = cache.get("mode", OptionScope::Global).unwrap();
        assert!(matches!(
            opt.value_u32(),
            Err(TeamError::OptionTypeMismatch { .. })
        ));
        assert_eq!(opt.value_str().unwrap(), "rr");
        assert_eq!(opt.value_len(), 2);
    }

    #[test]
    fn test_scope_resolution() {
        let mut cache = OptionCache::default();
        cache.apply(
            &[
                update("enabled", OptionScope::Port(5), OptionValue::Bool(true)),
                update("mode", OptionScope::Global, OptionValue::Str("rr".into())),
            ],
            Provenance::Delta,
        );

        assert!(cache.resolve("enabled", OptionScope::Port(5)).is_ok());
        assert!(matches!(
            cache.resolve("enabled", OptionScope::Global),
            Err(TeamError::OptionScopeMismatch { .. })
        ));
        assert!(matches!(
            cache.resolve("mode", OptionScope::Port(5)),
            Err(TeamError::OptionScopeMismatch { .. })
        ));
        assert!(matches!(
            cache.resolve("nosuch", OptionScope::Global),
            Err(TeamError::NotFound(_))
        ));
    }

    #[test]
    fn test_port_removal_withdraws_options() {
        let mut cache = OptionCache::default();
        cache.apply(
            &[
                update("enabled", OptionScope::Port(5), OptionValue::Bool(true)),
                update("enabled", OptionScope::Port(7), OptionValue::Bool(false)),
            ],
            Provenance::Delta,
        );

        assert!(cache.mark_port_removed(5));
        assert!(cache.get("enabled", OptionScope::Port(5)).unwrap().is_removed());
        assert!(!cache.get("enabled", OptionScope::Port(7)).unwrap().is_removed());

        cache.purge_removed();
        assert!(cache.get("enabled", OptionScope::Port(5)).is_none());
        assert!(cache.get("enabled", OptionScope::Port(7)).is_some());
    }

    #[test]
    fn test_snapshot_withdraws_absent() {
        let mut cache = OptionCache::default();
        cache.apply(
            &[
                update("mode", OptionScope::Global, OptionValue::Str("rr".into())),
                update("notify_peers_count", OptionScope::Global, OptionValue::U32(1)),
            ],
            Provenance::Snapshot,
        );

        assert!(cache.apply(
            &[update("mode", OptionScope::Global, OptionValue::Str("rr".into()))],
            Provenance::Snapshot,
        ));
        assert!(
            cache
                .get("notify_peers_count", OptionScope::Global)
                .unwrap()
                .is_removed()
        );
    }
}
