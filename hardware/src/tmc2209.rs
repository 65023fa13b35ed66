//! TMC2209 single-wire UART register access.
//!
//! When the stepper drivers are configured over UART the MS pins are left
//! unwired and microstep resolution comes from CHOPCONF. Frames are the
//! datagram format from the TMC2209 datasheet: sync nibble 0x05, node
//! address, register (bit 7 set for writes), 32-bit big-endian payload,
//! CRC-8 with polynomial 0x07.
//!
//! The link is generic over any `Read + Write` transport so the serial
//! port setup stays with the embedding binary.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// Register addresses used for pan/tilt driver bring-up.
pub mod reg {
    pub const GCONF: u8 = 0x00;
    pub const GSTAT: u8 = 0x01;
    pub const IFCNT: u8 = 0x02;
    pub const IHOLD_IRUN: u8 = 0x10;
    pub const TPOWERDOWN: u8 = 0x11;
    pub const TPWMTHRS: u8 = 0x13;
    pub const TCOOLTHRS: u8 = 0x14;
    pub const CHOPCONF: u8 = 0x6C;
    pub const DRV_STATUS: u8 = 0x6F;
    pub const PWMCONF: u8 = 0x70;
}

const SYNC: u8 = 0x05;
const WRITE_BIT: u8 = 0x80;

/// Gap between frames on a shared single-wire bus.
const INTER_FRAME_GAP: Duration = Duration::from_millis(1);

/// CRC-8, polynomial 0x07, as specified for TMC2209 UART datagrams.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// MRES field bits for a microstep resolution.
///
/// Returns `None` for resolutions the driver cannot produce.
pub fn mres_bits(microsteps: u32) -> Option<u32> {
    match microsteps {
        256 => Some(0),
        128 => Some(1),
        64 => Some(2),
        32 => Some(3),
        16 => Some(4),
        8 => Some(5),
        4 => Some(6),
        2 => Some(7),
        1 => Some(8),
        _ => None,
    }
}

/// IHOLD_IRUN: hold current, run current, hold delay.
pub fn pack_ihold_irun(ihold: u32, irun: u32, iholddelay: u32) -> u32 {
    ((iholddelay & 0x0F) << 16) | ((irun & 0x1F) << 8) | (ihold & 0x1F)
}

/// GCONF: pdn_disable enables UART control, mstep_reg_select moves
/// microstep selection from the MS pins into CHOPCONF.
pub fn pack_gconf(pdn_disable: bool, mstep_reg_select: bool) -> u32 {
    let mut v = 0;
    if pdn_disable {
        v |= 1 << 6;
    }
    if mstep_reg_select {
        v |= 1 << 7;
    }
    v
}

/// CHOPCONF chopper configuration with the MRES resolution field.
pub fn pack_chopconf(mres: u32, toff: u32, hstrt: u32, hend: u32, tbl: u32) -> u32 {
    (toff & 0x0F)
        | ((hstrt & 0x07) << 4)
        | ((hend & 0x0F) << 7)
        | ((tbl & 0x03) << 15)
        | ((mres & 0x0F) << 24)
}

/// PWMCONF stealthChop voltage PWM configuration.
pub fn pack_pwmconf(
    pwm_ofs: u32,
    pwm_grad: u32,
    pwm_freq: u32,
    autoscale: bool,
    autograd: bool,
    pwm_lim: u32,
) -> u32 {
    let mut v = (pwm_ofs & 0xFF) | ((pwm_grad & 0xFF) << 8) | ((pwm_freq & 0x03) << 16);
    if autoscale {
        v |= 1 << 18;
    }
    if autograd {
        v |= 1 << 19;
    }
    v | ((pwm_lim & 0x0F) << 28)
}

/// Register access to one TMC2209 node over a `Read + Write` transport.
pub struct Tmc2209Link<T> {
    port: T,
    addr: u8,
}

impl<T: Read + Write> Tmc2209Link<T> {
    pub fn new(port: T, addr: u8) -> Self {
        Self { port, addr }
    }

    /// Write a 32-bit register value.
    pub fn write_reg(&mut self, register: u8, value: u32) -> io::Result<()> {
        let mut frame = [
            SYNC,
            self.addr,
            (register & 0x7F) | WRITE_BIT,
            (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
            0,
        ];
        frame[7] = crc8(&frame[..7]);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        thread::sleep(INTER_FRAME_GAP);
        Ok(())
    }

    /// Read a 32-bit register value.
    pub fn read_reg(&mut self, register: u8) -> io::Result<u32> {
        let reg = register & 0x7F;
        let mut request = [SYNC, self.addr, reg, 0];
        request[3] = crc8(&request[..3]);
        self.port.write_all(&request)?;
        self.port.flush()?;

        let mut reply = [0u8; 8];
        self.port.read_exact(&mut reply)?;
        if reply[0] != SYNC || reply[1] != self.addr || reply[2] != reg {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad TMC2209 reply header: {reply:02x?}"),
            ));
        }
        if crc8(&reply[..7]) != reply[7] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TMC2209 reply CRC mismatch",
            ));
        }
        Ok(u32::from_be_bytes([reply[3], reply[4], reply[5], reply[6]]))
    }

    /// Apply the pan/tilt stepper tuning used by the turret: stealthChop
    /// with conservative run current, UART-selected microstepping.
    pub fn configure_defaults(&mut self, microsteps: u32) -> io::Result<()> {
        let mres = mres_bits(microsteps).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported microstep resolution: {microsteps}"),
            )
        })?;

        self.write_reg(reg::GCONF, pack_gconf(true, true))?;
        self.write_reg(reg::IHOLD_IRUN, pack_ihold_irun(0, 6, 1))?;
        self.write_reg(reg::TPOWERDOWN, 0x0000_0002)?;
        self.write_reg(reg::TPWMTHRS, 0)?;
        self.write_reg(reg::TCOOLTHRS, 0)?;
        self.write_reg(reg::CHOPCONF, pack_chopconf(mres, 3, 4, 0, 2))?;
        self.write_reg(reg::PWMCONF, pack_pwmconf(36, 14, 1, true, true, 12))?;

        // Touching IFCNT confirms the node is answering.
        self.read_reg(reg::IFCNT)?;
        Ok(())
    }
}
