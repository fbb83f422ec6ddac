//! HCI command builders
//!
//! Commands are organized by their command group, in the form
//! `commands::`*command group*`::`*command*. Each command is a parameter struct implementing
//! [`CommandParameter`]; `into_packet` produces the [`CommandPacket`] handed to the
//! [`CommandChannel`](crate::command_channel::CommandChannel).
//!
//! Commands that return data within the Command Complete event also carry a
//! `try_parse_return_parameter` constructor for their return parameter.

pub mod controller_baseband;
pub mod info_params;
pub mod le;
pub mod link_control;
pub mod vendor;

use crate::opcodes::HciCommand;
use alloc::vec::Vec;
use bluejay_core::errors::Error;
use core::fmt;

/// Trait for building the parameter of an HCI command
///
/// The parameter is the structure defined as the parameter part of the command packet for the
/// specific HCI command.
pub trait CommandParameter {
    /// The command to send to the Bluetooth Controller.
    ///
    /// This is the OGF & OCF pair.
    const COMMAND: HciCommand;

    /// Append the parameter bytes to `buffer`
    fn get_parameter(&self, buffer: &mut Vec<u8>);

    /// Build the command packet for this parameter
    fn into_packet(self) -> CommandPacket
    where
        Self: Sized,
    {
        let mut parameter = Vec::new();

        self.get_parameter(&mut parameter);

        CommandPacket {
            opcode: Self::COMMAND,
            parameter,
        }
    }
}

/// A built HCI command packet
///
/// The format of the raw packet is the two byte opcode, followed by the length of the parameter,
/// followed by the parameter.
#[derive(Clone, Debug)]
pub struct CommandPacket {
    opcode: HciCommand,
    parameter: Vec<u8>,
}

impl CommandPacket {
    /// Get the opcode of the command
    pub fn get_opcode(&self) -> HciCommand {
        self.opcode
    }

    /// Get the raw command packet
    ///
    /// # Panic
    /// The parameter must fit within the one byte length field.
    pub fn to_bytes(&self) -> Vec<u8> {
        assert!(self.parameter.len() <= <u8>::MAX.into());

        let mut bytes = Vec::with_capacity(3 + self.parameter.len());

        bytes.extend_from_slice(&self.opcode.into_opcode().to_le_bytes());

        bytes.push(self.parameter.len() as u8);

        bytes.extend_from_slice(&self.parameter);

        bytes
    }

    /// Get the parameter bytes
    pub fn get_parameter(&self) -> &[u8] {
        &self.parameter
    }
}

impl fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.opcode)
    }
}

/// Error from parsing a command's return parameter
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReturnParameterError {
    /// The status byte of the return parameter was not success
    Status(Error),
    /// The return parameter did not match the layout for the command
    Malformed,
}

impl fmt::Display for ReturnParameterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReturnParameterError::Status(error) => write!(f, "command failed, {}", error),
            ReturnParameterError::Malformed => f.write_str("malformed return parameter"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ReturnParameterError {}

impl From<ReturnParameterError> for bluejay_core::errors::HostError {
    fn from(error: ReturnParameterError) -> Self {
        match error {
            ReturnParameterError::Status(status) => bluejay_core::errors::HostError::Protocol(status),
            ReturnParameterError::Malformed => bluejay_core::errors::HostError::LinkError,
        }
    }
}

/// Split the status byte off the front of a return parameter
///
/// Returns the rest of the parameter when the status is success.
pub(crate) fn check_status(raw: &[u8]) -> Result<&[u8], ReturnParameterError> {
    let status = Error::from_raw(*raw.first().ok_or(ReturnParameterError::Malformed)?);

    status
        .into_result()
        .map_err(ReturnParameterError::Status)?;

    Ok(&raw[1..])
}

pub(crate) fn take<const N: usize>(raw: &[u8]) -> Result<[u8; N], ReturnParameterError> {
    raw.get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ReturnParameterError::Malformed)
}
