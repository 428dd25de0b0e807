// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Serial port transport.

use std::io;

use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::info;

use phdrv_core::{DynResult, LinkKind};

use crate::line::{LineLink, LineStream};

impl LineStream for SerialStream {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

pub fn open(path: &str, baud: u32) -> DynResult<LineLink<SerialStream>> {
    let port = tokio_serial::new(path, baud).open_native_async()?;
    info!("opened {} at {} baud", path, baud);
    Ok(LineLink::new(port, LinkKind::Serial))
}
