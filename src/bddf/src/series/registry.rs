use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;

use crate::format::MAX_PAYLOAD_SIZE;
use crate::series::{SeriesDescriptor, TypeMetadata};
use crate::{Error, Result};

/// is_valid_channel_name reports whether name is a `/` separated path of non-empty
/// segments made of `[A-Za-z0-9_.-]`.
pub fn is_valid_channel_name(name: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+(/[A-Za-z0-9_.\-]+)*$").unwrap();
    }

    RE.is_match(name)
}

/// SeriesRegistry maps channel ids and names to their descriptors.  Ids are assigned from
/// a counter starting at 0 and never reused.
#[derive(Debug, Default, Clone)]
pub struct SeriesRegistry {
    descriptors: BTreeMap<u32, Arc<SeriesDescriptor>>,
    ids: HashMap<String, u32>,
    next_id: u32,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register returns the id of the channel name, assigning a new one on first use.
    pub fn register(&mut self, name: &str, metadata: TypeMetadata) -> Result<u32> {
        let (descriptor, _) = self.register_with(name, metadata, BTreeMap::new())?;
        Ok(descriptor.channel_id)
    }

    /// register_with registers a channel carrying annotations.  The returned flag is true
    /// when the channel was created by this call.  Re-registering with identical metadata
    /// and annotations returns the existing descriptor; anything else is `DuplicateChannel`.
    pub fn register_with(
        &mut self,
        name: &str,
        metadata: TypeMetadata,
        annotations: BTreeMap<String, String>,
    ) -> Result<(Arc<SeriesDescriptor>, bool)> {
        if !is_valid_channel_name(name) {
            return Err(Error::InvalidChannelName(name.to_string()));
        }

        if let Some(existing) = self.lookup_by_name(name) {
            if existing.metadata == metadata && existing.annotations == annotations {
                return Ok((existing, false));
            }
            return Err(Error::DuplicateChannel {
                name: name.to_string(),
                channel_id: existing.channel_id,
            });
        }

        let descriptor = Arc::new(SeriesDescriptor {
            channel_id: self.next_id,
            channel_name: name.to_string(),
            metadata,
            annotations,
        });
        // every registered descriptor must fit in a record
        let size = descriptor.marshal_binary()?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.next_id += 1;

        self.ids.insert(name.to_string(), descriptor.channel_id);
        self.descriptors
            .insert(descriptor.channel_id, descriptor.clone());
        Ok((descriptor, true))
    }

    /// insert adds a descriptor read back from a file, keeping its id.  Returns false if the
    /// same descriptor is already present.
    pub fn insert(&mut self, descriptor: SeriesDescriptor) -> Result<bool> {
        if let Some(existing) = self.descriptors.get(&descriptor.channel_id) {
            if **existing == descriptor {
                return Ok(false);
            }
            return Err(Error::DuplicateChannel {
                name: descriptor.channel_name,
                channel_id: existing.channel_id,
            });
        }
        if let Some(&channel_id) = self.ids.get(descriptor.channel_name.as_str()) {
            return Err(Error::DuplicateChannel {
                name: descriptor.channel_name,
                channel_id,
            });
        }

        self.next_id = self.next_id.max(descriptor.channel_id.saturating_add(1));
        self.ids
            .insert(descriptor.channel_name.clone(), descriptor.channel_id);
        self.descriptors
            .insert(descriptor.channel_id, Arc::new(descriptor));
        Ok(true)
    }

    pub fn lookup(&self, channel_id: u32) -> Option<Arc<SeriesDescriptor>> {
        self.descriptors.get(&channel_id).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<SeriesDescriptor>> {
        self.ids.get(name).and_then(|id| self.lookup(*id))
    }

    /// iter visits descriptors in channel id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SeriesDescriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::series::registry::is_valid_channel_name;
    use crate::series::{PodField, PodType, SeriesRegistry, TypeMetadata};
    use crate::Error;

    fn temp() -> TypeMetadata {
        TypeMetadata::Pod {
            fields: vec![PodField::new("value", PodType::F32)],
        }
    }

    #[test]
    fn test_register_idempotent() {
        let mut registry = SeriesRegistry::new();
        let a = registry.register("temp", temp()).unwrap();
        let b = registry
            .register(
                "bosdyn-api/comment",
                TypeMetadata::Blob {
                    content_type: "text/plain".to_string(),
                },
            )
            .unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.register("temp", temp()).unwrap(), a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = SeriesRegistry::new();
        registry.register("temp", temp()).unwrap();

        let other = TypeMetadata::Pod {
            fields: vec![PodField::new("value", PodType::F64)],
        };
        match registry.register("temp", other) {
            Err(Error::DuplicateChannel { name, channel_id }) => {
                assert_eq!(name, "temp");
                assert_eq!(channel_id, 0);
            }
            r => panic!("unexpected {:?}", r),
        }

        let mut annotations = BTreeMap::new();
        annotations.insert("unit".to_string(), "K".to_string());
        assert!(registry.register_with("temp", temp(), annotations).is_err());

        // a failed registration does not consume an id
        assert_eq!(registry.register("humidity", temp()).unwrap(), 1);
    }

    #[test]
    fn test_lookup() {
        let mut registry = SeriesRegistry::new();
        let id = registry.register("robot/joints/torque", temp()).unwrap();

        let d = registry.lookup(id).unwrap();
        assert_eq!(d.channel_name, "robot/joints/torque");
        assert_eq!(registry.lookup_by_name("robot/joints/torque").unwrap(), d);
        assert!(registry.lookup(id + 1).is_none());
        assert!(registry.lookup_by_name("robot").is_none());
    }

    #[test]
    fn test_insert() {
        let mut source = SeriesRegistry::new();
        source.register("a", temp()).unwrap();
        source.register("b", temp()).unwrap();

        let mut registry = SeriesRegistry::new();
        let b = source.lookup(1).unwrap();
        assert!(registry.insert((*b).clone()).unwrap());
        assert!(!registry.insert((*b).clone()).unwrap());

        // ids continue after the highest inserted one
        assert_eq!(registry.register("c", temp()).unwrap(), 2);

        let mut conflict = (*b).clone();
        conflict.channel_name = "c".to_string();
        assert!(registry.insert(conflict).is_err());
    }

    #[test]
    fn test_channel_name() {
        for name in ["temp", "bosdyn-api/comment", "a.b/c_d/e-f", "0"] {
            assert!(is_valid_channel_name(name), "{}", name);
        }
        for name in ["", "/temp", "temp/", "a//b", "has space", "tab\t"] {
            assert!(!is_valid_channel_name(name), "{}", name);
        }

        let mut registry = SeriesRegistry::new();
        assert!(matches!(
            registry.register("a//b", temp()),
            Err(Error::InvalidChannelName(_))
        ));
    }
}
