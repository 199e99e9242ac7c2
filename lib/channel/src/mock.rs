// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scripted channel for protocol tests.
//!
//! Tests queue up the bytes the fake device will return, run the operation
//! under test, and then inspect the frames the host wrote. Reading more than
//! was queued fails the same way a real channel does on timeout.

use std::collections::VecDeque;

use crate::{Channel, ChannelError, ChannelKind};

#[derive(Default)]
pub struct MockChannel {
    usb: bool,
    queue: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that claims to be USB, for exercising reopen paths.
    pub fn usb() -> Self {
        MockChannel {
            usb: true,
            ..Self::default()
        }
    }

    /// Queue raw bytes for the host to read.
    pub fn queue_bytes(&mut self, data: &[u8]) {
        self.queue.extend(data);
    }

    /// Queue a RAM-kernel response header, optionally followed by a payload.
    pub fn queue_rkl_response(
        &mut self,
        ack: i16,
        checksum: u16,
        length: u32,
        payload: &[u8],
    ) {
        self.queue.extend(ack.to_be_bytes());
        self.queue.extend(checksum.to_be_bytes());
        self.queue.extend(length.to_be_bytes());
        self.queue.extend(payload);
    }

    /// Every `write` the host issued, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// All written bytes, flattened.
    pub fn sent_flat(&self) -> Vec<u8> {
        self.sent.concat()
    }

    /// Queued bytes the host has not read yet.
    pub fn unread(&self) -> usize {
        self.queue.len()
    }
}

impl Channel for MockChannel {
    fn open(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.queue.len() < buf.len() {
            return Err(ChannelError::ReadTimeout {
                wanted: buf.len(),
                got: self.queue.len(),
            });
        }
        let len = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.queue.drain(..len)) {
            *slot = byte;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        if self.usb {
            ChannelKind::Usb
        } else {
            ChannelKind::Serial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_reads_drain_the_queue() {
        let mut chan = MockChannel::new();
        chan.queue_bytes(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        chan.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(chan.unread(), 2);
    }

    #[test]
    fn short_queue_reads_like_a_timeout() {
        let mut chan = MockChannel::new();
        chan.queue_bytes(&[1, 2]);

        let mut buf = [0u8; 4];
        match chan.read_exact(&mut buf) {
            Err(ChannelError::ReadTimeout { wanted: 4, got: 2 }) => (),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn writes_are_captured_in_order() {
        let mut chan = MockChannel::new();
        chan.write(&[0xAA]).unwrap();
        chan.write(&[0xBB, 0xCC]).unwrap();
        assert_eq!(chan.sent(), &[vec![0xAA], vec![0xBB, 0xCC]]);
        assert_eq!(chan.sent_flat(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn reopen_is_a_no_op_for_serial() {
        let mut chan = MockChannel::new();
        crate::reopen(&mut chan).unwrap();
    }
}
