// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial-port channel.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{Channel, ChannelError, ChannelKind};

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A serial-port channel.
///
/// The line discipline is fixed by the boot ROM: 115200 baud, 8 data bits,
/// no parity, one stop bit, no flow control of any kind. The port is not
/// touched until [`Channel::open`].
pub struct UartChannel {
    path: String,
    port: Option<Box<dyn SerialPort>>,
}

impl UartChannel {
    pub fn new(path: impl Into<String>) -> Self {
        UartChannel {
            path: path.into(),
            port: None,
        }
    }
}

impl Channel for UartChannel {
    fn open(&mut self) -> Result<(), ChannelError> {
        let port = serialport::new(&self.path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let port = self.port.as_mut().ok_or(ChannelError::NotOpen)?;

        let mut got = 0;
        while got < buf.len() {
            match port.read(&mut buf[got..]) {
                // The port never returns 0 bytes except at timeout.
                Ok(0) => {
                    return Err(ChannelError::ReadTimeout {
                        wanted: buf.len(),
                        got,
                    });
                }
                Ok(n) => got += n,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    return Err(ChannelError::ReadTimeout {
                        wanted: buf.len(),
                        got,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let port = self.port.as_mut().ok_or(ChannelError::NotOpen)?;
        // Writes cannot stall with flow control off.
        port.write_all(data)?;
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Serial
    }
}
