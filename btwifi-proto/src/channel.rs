//! Command channels: the (commander, response) characteristic pair of a service
//!
//! A channel carries at most one message in each direction at a time. There
//! is no request id on the wire, so responses are matched to commands purely
//! by channel and command code.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::registry::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Wifi,
    System,
}

impl Channel {
    pub const COUNT: usize = 2;
    pub const ALL: [Channel; Channel::COUNT] = [Channel::Wifi, Channel::System];

    pub fn index(self) -> usize {
        match self {
            Channel::Wifi => 0,
            Channel::System => 1,
        }
    }

    /// Service owning the commander and response characteristics
    pub fn service(self) -> ServiceKind {
        match self {
            Channel::Wifi => ServiceKind::Wifi,
            Channel::System => ServiceKind::System,
        }
    }

    pub fn for_service(kind: ServiceKind) -> Option<Channel> {
        match kind {
            ServiceKind::Wifi => Some(Channel::Wifi),
            ServiceKind::System => Some(Channel::System),
            ServiceKind::DeviceInformation | ServiceKind::Network => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Wifi => "wifi",
            Channel::System => "system",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size map with one slot per channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap<T>([T; Channel::COUNT]);

impl<T: Default> Default for ChannelMap<T> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| T::default()))
    }
}

impl<T> ChannelMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Channel, &mut T)> {
        Channel::ALL.into_iter().zip(self.0.iter_mut())
    }
}

impl<T> Index<Channel> for ChannelMap<T> {
    type Output = T;

    fn index(&self, channel: Channel) -> &T {
        &self.0[channel.index()]
    }
}

impl<T> IndexMut<Channel> for ChannelMap<T> {
    fn index_mut(&mut self, channel: Channel) -> &mut T {
        &mut self.0[channel.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_cover_every_channel() {
        for (expected, channel) in Channel::ALL.into_iter().enumerate() {
            assert_eq!(channel.index(), expected);
            assert_eq!(Channel::for_service(channel.service()), Some(channel));
        }
        assert_eq!(Channel::for_service(ServiceKind::Network), None);
    }

    #[test]
    fn channel_map_slots_are_independent() {
        let mut map: ChannelMap<Option<u8>> = ChannelMap::default();
        map[Channel::System] = Some(7);
        assert_eq!(map[Channel::Wifi], None);
        assert_eq!(map[Channel::System], Some(7));
        assert_eq!(map.iter().filter(|(_, v)| v.is_some()).count(), 1);
    }
}
