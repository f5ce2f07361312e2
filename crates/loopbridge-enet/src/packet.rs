use serde::{Deserialize, Serialize};

use crate::command::{CommandBody, SendFragment};

/// Position of one fragment within a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub start_sequence_number: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

impl From<&SendFragment> for FragmentDescriptor {
    fn from(fragment: &SendFragment) -> Self {
        Self {
            start_sequence_number: fragment.start_sequence_number,
            fragment_count: fragment.fragment_count,
            fragment_number: fragment.fragment_number,
            total_length: fragment.total_length,
            fragment_offset: fragment.fragment_offset,
        }
    }
}

/// One application message, detached from ENet framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedPacket {
    pub channel_id: u8,
    pub fragment: Option<FragmentDescriptor>,
    pub data: Vec<u8>,
}

impl WrappedPacket {
    pub fn new(channel_id: u8, data: Vec<u8>) -> Self {
        Self {
            channel_id,
            fragment: None,
            data,
        }
    }

    /// Extract the application payload of a Send* command.
    pub fn from_command(channel_id: u8, body: &CommandBody) -> Option<Self> {
        match body {
            CommandBody::SendReliable(send) => Some(Self::new(channel_id, send.data.clone())),
            CommandBody::SendUnreliable(send) => Some(Self::new(channel_id, send.data.clone())),
            CommandBody::SendUnsequenced(send) => Some(Self::new(channel_id, send.data.clone())),
            CommandBody::SendFragment(send) => Some(Self {
                channel_id,
                fragment: Some(FragmentDescriptor::from(send)),
                data: send.data.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment.is_some()
    }
}
