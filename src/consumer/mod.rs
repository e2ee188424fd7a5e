//! Memory Consumers
//!
//! Entities that own memory and receive colors: the kernel, subjects and the
//! channels between them. Kernels and subjects also execute; a channel is
//! accessed by its writer and its readers.
//!
//! Consumers live in a [`Consumers`] arena and refer to each other by
//! [`ConsumerId`]. Constructing a channel registers it in the channel maps of
//! both ends.

pub mod address_space;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::color::SystemPageColorId;
use crate::error::{Error, Result};

pub use address_space::AddressRange;

// =============================================================================
// Identity and Roles
// =============================================================================

/// Index of a consumer in its [`Consumers`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(usize);

impl ConsumerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Consumer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
    Kernel,
    Subject,
    Channel,
}

impl std::fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerKind::Kernel => write!(f, "kernel"),
            ConsumerKind::Subject => write!(f, "subject"),
            ConsumerKind::Channel => write!(f, "channel"),
        }
    }
}

/// Directed channel maps of an executor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorChannels {
    /// Target executor -> channels written towards it
    outgoing: BTreeMap<ConsumerId, Vec<ConsumerId>>,
    /// Source executor -> channels read from it
    incoming: BTreeMap<ConsumerId, Vec<ConsumerId>>,
}

impl ExecutorChannels {
    pub fn outgoing_to(&self, target: ConsumerId) -> &[ConsumerId] {
        self.outgoing.get(&target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_from(&self, source: ConsumerId) -> &[ConsumerId] {
        self.incoming.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every channel written or read, without duplicates
    pub fn all(&self) -> BTreeSet<ConsumerId> {
        self.outgoing
            .values()
            .chain(self.incoming.values())
            .flatten()
            .copied()
            .collect()
    }
}

/// Capabilities of a consumer beyond owning memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerRole {
    Kernel(ExecutorChannels),
    Subject(ExecutorChannels),
    Channel {
        writer: ConsumerId,
        readers: Vec<ConsumerId>,
    },
}

// =============================================================================
// Colored Region
// =============================================================================

/// Memory that accumulates system page colors
pub trait ColoredRegion {
    /// Executors accessing this memory; an executor accesses its own memory
    fn executors(&self) -> Vec<ConsumerId>;

    fn add_color(&mut self, color: SystemPageColorId);

    fn colors(&self) -> &[SystemPageColorId];

    fn reset_colors(&mut self);
}

// =============================================================================
// Memory Consumer
// =============================================================================

#[derive(Debug, Clone)]
pub struct MemoryConsumer {
    id: ConsumerId,
    name: String,
    memory_size: u64,
    address_space: Option<Vec<AddressRange>>,
    colors: Vec<SystemPageColorId>,
    role: ConsumerRole,
}

impl MemoryConsumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConsumerKind {
        match self.role {
            ConsumerRole::Kernel(_) => ConsumerKind::Kernel,
            ConsumerRole::Subject(_) => ConsumerKind::Subject,
            ConsumerRole::Channel { .. } => ConsumerKind::Channel,
        }
    }

    pub fn role(&self) -> &ConsumerRole {
        &self.role
    }

    pub fn is_executor(&self) -> bool {
        self.channels().is_some()
    }

    /// Channel maps of an executor, `None` for channels
    pub fn channels(&self) -> Option<&ExecutorChannels> {
        match &self.role {
            ConsumerRole::Kernel(channels) | ConsumerRole::Subject(channels) => Some(channels),
            ConsumerRole::Channel { .. } => None,
        }
    }

    fn channels_mut(&mut self) -> Option<&mut ExecutorChannels> {
        match &mut self.role {
            ConsumerRole::Kernel(channels) | ConsumerRole::Subject(channels) => Some(channels),
            ConsumerRole::Channel { .. } => None,
        }
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn address_space(&self) -> Option<&[AddressRange]> {
        self.address_space.as_deref()
    }

    /// Pin the consumer to explicit physical ranges
    pub fn set_address_space(&mut self, ranges: Vec<AddressRange>) -> Result<()> {
        address_space::validate(&self.name, self.memory_size, &ranges)?;
        self.address_space = Some(ranges);
        Ok(())
    }
}

impl ColoredRegion for MemoryConsumer {
    fn executors(&self) -> Vec<ConsumerId> {
        match &self.role {
            ConsumerRole::Kernel(_) | ConsumerRole::Subject(_) => vec![self.id],
            ConsumerRole::Channel { writer, readers } => {
                let mut executors = Vec::with_capacity(readers.len() + 1);
                executors.push(*writer);
                for reader in readers {
                    if !executors.contains(reader) {
                        executors.push(*reader);
                    }
                }
                executors
            }
        }
    }

    fn add_color(&mut self, color: SystemPageColorId) {
        self.colors.push(color);
    }

    fn colors(&self) -> &[SystemPageColorId] {
        &self.colors
    }

    fn reset_colors(&mut self) {
        self.colors.clear();
    }
}

impl std::fmt::Display for MemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.name)
    }
}

// =============================================================================
// Consumer Arena
// =============================================================================

/// All memory consumers of a system, in registration order
#[derive(Debug, Clone)]
pub struct Consumers {
    page_size: u64,
    consumers: Vec<MemoryConsumer>,
    by_name: HashMap<String, ConsumerId>,
}

impl Consumers {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            consumers: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn add_kernel(&mut self, name: impl Into<String>, memory_size: u64) -> Result<ConsumerId> {
        self.insert(name.into(), memory_size, |_| Ok(ConsumerRole::Kernel(ExecutorChannels::default())))
    }

    pub fn add_subject(&mut self, name: impl Into<String>, memory_size: u64) -> Result<ConsumerId> {
        self.insert(name.into(), memory_size, |_| Ok(ConsumerRole::Subject(ExecutorChannels::default())))
    }

    /// Add a channel written by `writer` and read by `readers`, registering it
    /// in the channel maps of every end
    pub fn add_channel(
        &mut self,
        name: impl Into<String>,
        memory_size: u64,
        writer: ConsumerId,
        readers: &[ConsumerId],
    ) -> Result<ConsumerId> {
        let name = name.into();

        let mut unique_readers: Vec<ConsumerId> = Vec::with_capacity(readers.len());
        for reader in readers {
            if !unique_readers.contains(reader) {
                unique_readers.push(*reader);
            }
        }

        let id = self.insert(name, memory_size, |arena| {
            if unique_readers.is_empty() {
                return Err("a channel needs at least one reader".to_string());
            }
            for end in std::iter::once(&writer).chain(unique_readers.iter()) {
                match arena.get(*end) {
                    Some(consumer) if consumer.is_executor() => {}
                    Some(consumer) => return Err(format!("{} is not an executor", consumer)),
                    None => return Err(format!("endpoint #{} does not exist", end.index())),
                }
            }
            Ok(ConsumerRole::Channel {
                writer,
                readers: unique_readers.clone(),
            })
        })?;

        for reader in &unique_readers {
            if let Some(channels) = self.consumers[writer.0].channels_mut() {
                channels.outgoing.entry(*reader).or_default().push(id);
            }
            if let Some(channels) = self.consumers[reader.0].channels_mut() {
                channels.incoming.entry(writer).or_default().push(id);
            }
        }

        Ok(id)
    }

    fn insert(
        &mut self,
        name: String,
        memory_size: u64,
        role: impl FnOnce(&Self) -> std::result::Result<ConsumerRole, String>,
    ) -> Result<ConsumerId> {
        let invalid = |reason: String| Error::InvalidConsumer {
            name: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.by_name.contains_key(&name) {
            return Err(invalid("name is already taken".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::Config("consumer page size must be positive".to_string()));
        }
        if memory_size == 0 || memory_size % self.page_size != 0 {
            return Err(invalid(format!(
                "memory size {} is not a positive multiple of the page size {}",
                memory_size, self.page_size
            )));
        }

        let role = role(self).map_err(invalid)?;
        let id = ConsumerId(self.consumers.len());

        debug!(consumer = %name, id = id.0, memory_size, "Registered memory consumer");

        self.by_name.insert(name.clone(), id);
        self.consumers.push(MemoryConsumer {
            id,
            name,
            memory_size,
            address_space: None,
            colors: Vec::new(),
            role,
        });
        Ok(id)
    }

    pub fn get(&self, id: ConsumerId) -> Option<&MemoryConsumer> {
        self.consumers.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConsumerId) -> Option<&mut MemoryConsumer> {
        self.consumers.get_mut(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<&MemoryConsumer> {
        self.id_of(name).and_then(|id| self.get(id))
    }

    pub fn id_of(&self, name: &str) -> Option<ConsumerId> {
        self.by_name.get(name).copied()
    }

    /// Id of a consumer by name, or [`Error::UnknownConsumer`]
    pub fn require(&self, name: &str) -> Result<ConsumerId> {
        self.id_of(name)
            .ok_or_else(|| Error::UnknownConsumer(name.to_string()))
    }

    /// Display name of `id`, for messages
    pub fn name_of(&self, id: ConsumerId) -> String {
        self.get(id)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| format!("#{}", id.0))
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        id.0 < self.consumers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryConsumer> {
        self.consumers.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConsumerId> + '_ {
        self.consumers.iter().map(|c| c.id)
    }

    /// Kernels and subjects, in registration order
    pub fn executors(&self) -> impl Iterator<Item = &MemoryConsumer> {
        self.consumers.iter().filter(|c| c.is_executor())
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    // =========================================================================
    // Channel Queries
    // =========================================================================

    /// Channels written by `executor` and read by `target`
    pub fn outgoing_channels(&self, executor: ConsumerId, target: ConsumerId) -> Vec<ConsumerId> {
        self.get(executor)
            .and_then(MemoryConsumer::channels)
            .map(|c| c.outgoing_to(target).to_vec())
            .unwrap_or_default()
    }

    /// Channels read by `executor` and written by `source`
    pub fn incoming_channels(&self, executor: ConsumerId, source: ConsumerId) -> Vec<ConsumerId> {
        self.get(executor)
            .and_then(MemoryConsumer::channels)
            .map(|c| c.incoming_from(source).to_vec())
            .unwrap_or_default()
    }

    /// Channels in either direction between `a` and `b`
    pub fn inout_channels(&self, a: ConsumerId, b: ConsumerId) -> Vec<ConsumerId> {
        let mut channels = self.outgoing_channels(a, b);
        for channel in self.incoming_channels(a, b) {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }

    /// Every channel `executor` reads or writes
    pub fn channels_of(&self, executor: ConsumerId) -> Vec<ConsumerId> {
        self.get(executor)
            .and_then(MemoryConsumer::channels)
            .map(|c| c.all().into_iter().collect())
            .unwrap_or_default()
    }

    /// Clear every consumer's accumulated colors
    pub fn reset_colors(&mut self) {
        for consumer in &mut self.consumers {
            consumer.reset_colors();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::CpuCoreAllocator;
    use assert_matches::assert_matches;

    const PAGE: u64 = 4096;

    fn arena() -> (Consumers, ConsumerId, ConsumerId, ConsumerId) {
        let mut consumers = Consumers::new(PAGE);
        let kernel = consumers.add_kernel("Kernel", PAGE).unwrap();
        let linux = consumers.add_subject("Linux", 4 * PAGE).unwrap();
        let crypto = consumers.add_subject("Crypto", PAGE).unwrap();
        (consumers, kernel, linux, crypto)
    }

    #[test]
    fn test_names_unique_and_non_empty() {
        let (mut consumers, ..) = arena();
        assert_matches!(
            consumers.add_subject("Linux", PAGE),
            Err(Error::InvalidConsumer { name, .. }) if name == "Linux"
        );
        assert_matches!(consumers.add_subject("", PAGE), Err(Error::InvalidConsumer { .. }));
    }

    #[test]
    fn test_memory_size_must_be_page_multiple() {
        let (mut consumers, ..) = arena();
        assert_matches!(consumers.add_subject("A", 0), Err(Error::InvalidConsumer { .. }));
        assert_matches!(consumers.add_subject("B", PAGE + 1), Err(Error::InvalidConsumer { .. }));
        assert_eq!(consumers.len(), 3);
    }

    #[test]
    fn test_channel_registers_on_both_ends() {
        let (mut consumers, _, linux, crypto) = arena();
        let request = consumers.add_channel("Linux->Crypto", PAGE, linux, &[crypto]).unwrap();
        let response = consumers.add_channel("Crypto->Linux", PAGE, crypto, &[linux]).unwrap();

        assert_eq!(consumers.outgoing_channels(linux, crypto), vec![request]);
        assert_eq!(consumers.incoming_channels(crypto, linux), vec![request]);
        assert_eq!(consumers.incoming_channels(linux, crypto), vec![response]);
        assert_eq!(consumers.inout_channels(linux, crypto), vec![request, response]);
        assert_eq!(consumers.channels_of(crypto), vec![request, response]);

        let channel = consumers.get(request).unwrap();
        assert_eq!(channel.kind(), ConsumerKind::Channel);
        assert_eq!(channel.executors(), vec![linux, crypto]);
        assert!(!channel.is_executor());
    }

    #[test]
    fn test_channel_with_many_readers() {
        let (mut consumers, kernel, linux, crypto) = arena();
        let broadcast = consumers
            .add_channel("Broadcast", PAGE, kernel, &[linux, crypto, linux])
            .unwrap();
        assert_eq!(consumers.get(broadcast).unwrap().executors(), vec![kernel, linux, crypto]);
        assert_eq!(consumers.outgoing_channels(kernel, crypto), vec![broadcast]);
        assert_eq!(consumers.channels_of(kernel), vec![broadcast]);
    }

    #[test]
    fn test_channel_endpoints_validated() {
        let (mut consumers, _, linux, crypto) = arena();
        assert_matches!(
            consumers.add_channel("None", PAGE, linux, &[]),
            Err(Error::InvalidConsumer { .. })
        );
        let channel = consumers.add_channel("A", PAGE, linux, &[crypto]).unwrap();
        assert_matches!(
            consumers.add_channel("B", PAGE, channel, &[crypto]),
            Err(Error::InvalidConsumer { .. })
        );
        assert_matches!(
            consumers.add_channel("C", PAGE, linux, &[ConsumerId(99)]),
            Err(Error::InvalidConsumer { .. })
        );
        assert!(consumers.id_of("C").is_none());
    }

    #[test]
    fn test_executors_of_self() {
        let (consumers, kernel, ..) = arena();
        assert_eq!(consumers.get(kernel).unwrap().executors(), vec![kernel]);
        assert_eq!(consumers.executors().count(), 3);
    }

    #[test]
    fn test_colors_accumulate_and_reset() {
        let (mut consumers, _, linux, _) = arena();
        let cpu = CpuCoreAllocator::new().allocate();
        {
            let consumer = consumers.get_mut(linux).unwrap();
            consumer.add_color(SystemPageColorId::new(cpu, 0));
            consumer.add_color(SystemPageColorId::new(cpu, 1));
        }
        assert_eq!(consumers.get(linux).unwrap().colors().len(), 2);

        consumers.reset_colors();
        assert!(consumers.iter().all(|c| c.colors().is_empty()));
    }

    #[test]
    fn test_address_space_assignment() {
        let (mut consumers, _, linux, _) = arena();
        let consumer = consumers.get_mut(linux).unwrap();
        assert_matches!(
            consumer.set_address_space(vec![AddressRange::with_len(0, PAGE)]),
            Err(Error::AddressSpace { .. })
        );
        assert!(consumer.address_space().is_none());

        consumer
            .set_address_space(vec![AddressRange::with_len(0, 4 * PAGE)])
            .unwrap();
        assert_eq!(consumer.address_space().unwrap().len(), 1);
    }

    #[test]
    fn test_require_unknown_name() {
        let (consumers, ..) = arena();
        assert_matches!(consumers.require("Nobody"), Err(Error::UnknownConsumer(name)) if name == "Nobody");
    }
}
