// Type registry: the type <-> id mapping both ends of a connection must share.
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result, SofObject, SofRead, SofReader};

type DecodeFn = fn(&mut SofReader<'_>) -> Result<Arc<dyn SofObject>>;

#[derive(Clone, Copy)]
struct Registration {
    name: &'static str,
    decode: DecodeFn,
}

/// Immutable, bidirectional mapping between payload types and wire type ids.
///
/// Ids are the compatibility contract; once published they are never reused
/// for another type.
///
/// ```
/// use logbus_sof::{SofConfiguration, SofObject, SofRead, SofReader, SofWriter};
///
/// #[derive(Debug)]
/// struct Heartbeat;
///
/// impl SofObject for Heartbeat {
///     fn write_fields(&self, _writer: &mut SofWriter<'_>) -> logbus_sof::Result<()> {
///         Ok(())
///     }
/// }
///
/// impl SofRead for Heartbeat {
///     fn read_fields(_reader: &mut SofReader<'_>) -> logbus_sof::Result<Self> {
///         Ok(Heartbeat)
///     }
/// }
///
/// let config = SofConfiguration::builder()
///     .register::<Heartbeat>(40)
///     .unwrap()
///     .build();
/// assert_eq!(config.type_id::<Heartbeat>().unwrap(), 40);
/// assert!(config.is_registered(40));
/// assert!(!config.is_micro_format());
/// ```
#[derive(Clone, Default)]
pub struct SofConfiguration {
    by_type: HashMap<TypeId, i32>,
    by_id: HashMap<i32, Registration>,
    micro_format: bool,
}

impl SofConfiguration {
    pub fn builder() -> SofConfigurationBuilder {
        SofConfigurationBuilder::default()
    }

    pub fn is_micro_format(&self) -> bool {
        self.micro_format
    }

    pub fn is_registered(&self, type_id: i32) -> bool {
        self.by_id.contains_key(&type_id)
    }

    pub fn type_id<T: SofObject>(&self) -> Result<i32> {
        self.type_id_of(TypeId::of::<T>(), std::any::type_name::<T>())
    }

    pub(crate) fn type_id_of(&self, key: TypeId, name: &'static str) -> Result<i32> {
        self.by_type
            .get(&key)
            .copied()
            .ok_or(Error::UnregisteredType(name))
    }

    /// Name the type registered under `type_id`, mostly for diagnostics.
    pub fn type_name(&self, type_id: i32) -> Option<&'static str> {
        self.by_id.get(&type_id).map(|registration| registration.name)
    }

    /// Registered ids in ascending order.
    pub fn type_ids(&self) -> Vec<i32> {
        let mut ids = self.by_id.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn decode(
        &self,
        type_id: i32,
        length: usize,
        reader: &mut SofReader<'_>,
    ) -> Result<Arc<dyn SofObject>> {
        match self.by_id.get(&type_id) {
            Some(registration) => (registration.decode)(reader),
            None => Err(Error::UnknownType { type_id, length }),
        }
    }
}

impl std::fmt::Debug for SofConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types = self
            .by_id
            .iter()
            .map(|(id, registration)| (*id, registration.name))
            .collect::<Vec<_>>();
        types.sort_unstable_by_key(|(id, _)| *id);
        f.debug_struct("SofConfiguration")
            .field("types", &types)
            .field("micro_format", &self.micro_format)
            .finish()
    }
}

#[derive(Default)]
pub struct SofConfigurationBuilder {
    config: SofConfiguration,
}

impl SofConfigurationBuilder {
    /// Map `T` to `type_id`. Ids and types must both be unique.
    pub fn register<T: SofObject + SofRead>(mut self, type_id: i32) -> Result<Self> {
        if type_id < 0 {
            return Err(Error::Registration(format!(
                "type id {type_id} collides with the built-in type tags"
            )));
        }
        if let Some(existing) = self.config.by_id.get(&type_id) {
            return Err(Error::Registration(format!(
                "type id {type_id} is already registered to {}",
                existing.name
            )));
        }
        let key = TypeId::of::<T>();
        let name = std::any::type_name::<T>();
        if let Some(existing) = self.config.by_type.get(&key) {
            return Err(Error::Registration(format!(
                "{name} is already registered as type id {existing}"
            )));
        }
        self.config.by_type.insert(key, type_id);
        self.config.by_id.insert(
            type_id,
            Registration {
                name,
                decode: decode_erased::<T>,
            },
        );
        Ok(self)
    }

    pub fn micro_format(mut self, enabled: bool) -> Self {
        self.config.micro_format = enabled;
        self
    }

    pub fn build(self) -> SofConfiguration {
        self.config
    }
}

fn decode_erased<T: SofObject + SofRead>(
    reader: &mut SofReader<'_>,
) -> Result<Arc<dyn SofObject>> {
    Ok(Arc::new(T::read_fields(reader)?))
}
