/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use super::BmcInfo;
use std::io;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Longest announcement buffered while waiting for a newline.
pub const MAX_BUFFER_SIZE: usize = 256;

/// Write sink on a VM's serial output that extracts the BMC address
/// announced by the guest.
///
/// The first newline terminated line is trimmed and sent as a [BmcInfo].
/// Everything written after that is dropped. If no newline shows up within
/// [MAX_BUFFER_SIZE] bytes the buffered data is discarded and scanning
/// starts over.
#[derive(Debug)]
pub struct BmcSignalInterceptor {
    serial: String,
    buffer: Vec<u8>,
    sent: bool,
    tx: mpsc::Sender<BmcInfo>,
}

impl BmcSignalInterceptor {
    pub fn new(serial: impl Into<String>, tx: mpsc::Sender<BmcInfo>) -> Self {
        Self { serial: serial.into(), buffer: Vec::new(), sent: false, tx }
    }

    pub fn has_sent(&self) -> bool {
        self.sent
    }

    fn emit(&mut self, info: BmcInfo) {
        self.sent = true;
        self.buffer = Vec::new();
        debug!(
            serial = %info.serial,
            address = %info.address,
            "guest announced BMC address"
        );

        match self.tx.try_send(info) {
            Ok(()) => {}
            Err(TrySendError::Full(info)) => {
                // never stall the guest's stdout on a busy server
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let _ = handle.spawn(async move {
                            let _ = tx.send(info).await;
                        });
                    }
                    Err(_) => {
                        warn!(
                            serial = %self.serial,
                            "BMC queue full, announcement dropped"
                        );
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(
                    serial = %self.serial,
                    "BMC server is gone, announcement dropped"
                );
            }
        }
    }
}

impl io::Write for BmcSignalInterceptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sent {
            return Ok(buf.len());
        }

        let Some(index) = buf.iter().position(|b| *b == b'\n') else {
            self.buffer.extend_from_slice(buf);
            if self.buffer.len() > MAX_BUFFER_SIZE {
                warn!(
                    serial = %self.serial,
                    size = self.buffer.len(),
                    "discarding oversized data received from guest VM"
                );
                self.buffer.clear();
            }
            return Ok(buf.len());
        };

        self.buffer.extend_from_slice(&buf[..index]);
        let address = String::from_utf8_lossy(&self.buffer).trim().to_string();
        let info = BmcInfo { serial: self.serial.clone(), address };
        self.emit(info);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
