//! HCI command opcodes
//!
//! An opcode is composed of a group identifier (OGF) and a command identifier within the group
//! (OCF). Instead of juggling the raw fields, the enum [`HciCommand`] enumerates every command
//! this host sends; the raw opcode for a command comes from the method `into_opcode`.
//!
//! ```
//! # use bluejay_hci::opcodes::{ControllerAndBaseband, HciCommand};
//! assert_eq!(0xC03, HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset).into_opcode());
//! ```

use core::fmt;

/// Enumeration of the HCI command opcodes used by this host
///
/// `HciCommand` consists of the HCI command groups containing the commands within the group.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum HciCommand {
    LinkControl(LinkControl),
    ControllerAndBaseband(ControllerAndBaseband),
    InformationParameters(InformationParameters),
    LEController(LEController),
    VendorSpecific(VendorSpecific),
}

impl HciCommand {
    /// Get the opcode for this command
    pub const fn into_opcode(self) -> u16 {
        self.into_opcode_pair().into_opcode()
    }

    /// Get the `OpCodePair` for this command
    pub const fn into_opcode_pair(self) -> OpCodePair {
        match self {
            HciCommand::LinkControl(ocf) => ocf.into_opcode_pair(),
            HciCommand::ControllerAndBaseband(ocf) => ocf.into_opcode_pair(),
            HciCommand::InformationParameters(ocf) => ocf.into_opcode_pair(),
            HciCommand::LEController(ocf) => ocf.into_opcode_pair(),
            HciCommand::VendorSpecific(ocf) => ocf.into_opcode_pair(),
        }
    }

    /// Try to get the `HciCommand` for a raw opcode
    pub fn try_from_opcode(opcode: u16) -> Result<Self, UnknownOpcode> {
        HciCommand::try_from(OpCodePair::from_opcode(opcode))
    }
}

impl fmt::Display for HciCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pair = self.into_opcode_pair();

        let (group, command): (&str, &dyn fmt::Debug) = match self {
            HciCommand::LinkControl(c) => ("link control", c),
            HciCommand::ControllerAndBaseband(c) => ("controller and baseband", c),
            HciCommand::InformationParameters(c) => ("information parameters", c),
            HciCommand::LEController(c) => ("LE controller", c),
            HciCommand::VendorSpecific(c) => ("vendor specific", c),
        };

        write!(f, "{} - {:?} ({:#x}:{:#x})", group, command, pair.ogf, pair.ocf)
    }
}

/// Error of [`HciCommand::try_from_opcode`] for an opcode this host never sends
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UnknownOpcode(pub u16);

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown opcode ({:#06x})", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UnknownOpcode {}

/// The pair of OGF (OpCode Group Field) and OCF (OpCode Command Field)
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OpCodePair {
    pub ogf: u16,
    pub ocf: u16,
}

impl OpCodePair {
    /// Convert the `OpCodePair` into the raw opcode
    pub const fn into_opcode(self) -> u16 {
        // The lower 10 bits of an opcode is the OCF and the upper 6 bits is the OGF
        (self.ocf & 0x3FF) | (self.ogf << 10)
    }

    /// Convert a raw opcode into an `OpCodePair`
    pub const fn from_opcode(opcode: u16) -> Self {
        OpCodePair {
            ogf: opcode >> 10,
            ocf: opcode & 0x3FF,
        }
    }
}

impl TryFrom<OpCodePair> for HciCommand {
    type Error = UnknownOpcode;

    fn try_from(pair: OpCodePair) -> Result<Self, Self::Error> {
        let unknown = UnknownOpcode(pair.into_opcode());

        match pair.ogf {
            0x01 => LinkControl::try_from_ocf(pair.ocf)
                .map(HciCommand::LinkControl)
                .ok_or(unknown),
            0x03 => ControllerAndBaseband::try_from_ocf(pair.ocf)
                .map(HciCommand::ControllerAndBaseband)
                .ok_or(unknown),
            0x04 => InformationParameters::try_from_ocf(pair.ocf)
                .map(HciCommand::InformationParameters)
                .ok_or(unknown),
            0x08 => LEController::try_from_ocf(pair.ocf)
                .map(HciCommand::LEController)
                .ok_or(unknown),
            0x3F => VendorSpecific::try_from_ocf(pair.ocf)
                .map(HciCommand::VendorSpecific)
                .ok_or(unknown),
            _ => Err(unknown),
        }
    }
}

macro_rules! opcode_group {
    (
        $(#[$docs:meta])*
        $group:ident, $ogf:expr, {
            $( $command:ident => $ocf:expr, )*
        }
    ) => {
        $(#[$docs])*
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
        pub enum $group {
            $( $command, )*
        }

        impl $group {
            /// Get the `OpCodePair` for this command
            pub const fn into_opcode_pair(self) -> OpCodePair {
                let ocf = match self {
                    $( $group::$command => $ocf, )*
                };

                OpCodePair { ogf: $ogf, ocf }
            }

            fn try_from_ocf(ocf: u16) -> Option<Self> {
                match ocf {
                    $( $ocf => Some($group::$command), )*
                    _ => None,
                }
            }
        }

        impl From<$group> for HciCommand {
            fn from(command: $group) -> HciCommand {
                HciCommand::$group(command)
            }
        }
    };
}

opcode_group! {
    /// Link control command group (OGF 0x1)
    LinkControl, 0x01, {
        Inquiry => 0x0001,
        InquiryCancel => 0x0002,
        CreateConnection => 0x0005,
        Disconnect => 0x0006,
        CreateConnectionCancel => 0x0008,
        AcceptConnectionRequest => 0x0009,
        RejectConnectionRequest => 0x000A,
        LinkKeyRequestReply => 0x000B,
        LinkKeyRequestNegativeReply => 0x000C,
        PinCodeRequestReply => 0x000D,
        PinCodeRequestNegativeReply => 0x000E,
        AuthenticationRequested => 0x0011,
        SetConnectionEncryption => 0x0013,
        RemoteNameRequest => 0x0019,
        ReadRemoteSupportedFeatures => 0x001B,
        ReadRemoteExtendedFeatures => 0x001C,
        ReadRemoteVersionInformation => 0x001D,
        SetupSynchronousConnection => 0x0028,
        AcceptSynchronousConnectionRequest => 0x0029,
        RejectSynchronousConnectionRequest => 0x002A,
        IoCapabilityRequestReply => 0x002B,
        UserConfirmationRequestReply => 0x002C,
        UserConfirmationRequestNegativeReply => 0x002D,
        UserPasskeyRequestReply => 0x002E,
        UserPasskeyRequestNegativeReply => 0x002F,
        IoCapabilityRequestNegativeReply => 0x0034,
    }
}

opcode_group! {
    /// Controller and baseband command group (OGF 0x3)
    ControllerAndBaseband, 0x03, {
        SetEventMask => 0x0001,
        Reset => 0x0003,
        WriteLocalName => 0x0013,
        WriteScanEnable => 0x001A,
        WriteAutomaticFlushTimeout => 0x0028,
        WriteClassOfDevice => 0x0024,
        WriteInquiryMode => 0x0045,
        WriteSimplePairingMode => 0x0056,
        WriteLeHostSupport => 0x006D,
        WriteSecureConnectionsHostSupport => 0x007A,
        WriteSynchronousFlowControlEnable => 0x002F,
    }
}

opcode_group! {
    /// Information parameters command group (OGF 0x4)
    InformationParameters, 0x04, {
        ReadLocalVersionInformation => 0x0001,
        ReadLocalSupportedCommands => 0x0002,
        ReadLocalSupportedFeatures => 0x0003,
        ReadLocalExtendedFeatures => 0x0004,
        ReadBufferSize => 0x0005,
        ReadBdAddr => 0x0009,
    }
}

opcode_group! {
    /// LE controller command group (OGF 0x8)
    LEController, 0x08, {
        SetEventMask => 0x0001,
        ReadBufferSize => 0x0002,
        ReadLocalSupportedFeatures => 0x0003,
        SetRandomAddress => 0x0005,
        SetAdvertisingParameters => 0x0006,
        SetAdvertisingData => 0x0008,
        SetScanResponseData => 0x0009,
        SetAdvertisingEnable => 0x000A,
        SetScanParameters => 0x000B,
        SetScanEnable => 0x000C,
        CreateConnection => 0x000D,
        CreateConnectionCancel => 0x000E,
        ReadRemoteFeatures => 0x0016,
        LongTermKeyRequestReply => 0x001A,
        LongTermKeyRequestNegativeReply => 0x001B,
        ReadBufferSizeV2 => 0x0060,
        SetExtendedAdvertisingParameters => 0x0036,
        SetExtendedAdvertisingData => 0x0037,
        SetExtendedScanResponseData => 0x0038,
        SetExtendedAdvertisingEnable => 0x0039,
        RemoveAdvertisingSet => 0x003C,
        SetExtendedScanParameters => 0x0041,
        SetExtendedScanEnable => 0x0042,
        ExtendedCreateConnection => 0x0043,
    }
}

opcode_group! {
    /// Vendor specific command group (OGF 0x3F)
    ///
    /// These are the Android vendor extensions. `LeGetVendorCapabilities` reports which of the
    /// extensions the Controller implements; `LeMultiAdvt` is the multi advertising suite whose
    /// first parameter byte selects a sub command.
    VendorSpecific, 0x3F, {
        LeGetVendorCapabilities => 0x0153,
        LeMultiAdvt => 0x0154,
    }
}

/// Sub opcodes of the vendor `LeMultiAdvt` command
///
/// The first parameter byte of every `LeMultiAdvt` command packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MultiAdvtSubOpcode {
    SetParameters,
    SetData,
    SetScanResponseData,
    SetRandomAddress,
    Enable,
}

impl MultiAdvtSubOpcode {
    pub const fn into_sub_opcode(self) -> u8 {
        match self {
            MultiAdvtSubOpcode::SetParameters => 0x01,
            MultiAdvtSubOpcode::SetData => 0x02,
            MultiAdvtSubOpcode::SetScanResponseData => 0x03,
            MultiAdvtSubOpcode::SetRandomAddress => 0x04,
            MultiAdvtSubOpcode::Enable => 0x05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_code_test() {
        let ogf = 0x8;
        let ocf = 0xa;
        let oc = HciCommand::LEController(LEController::SetAdvertisingEnable);

        assert_eq!(oc, HciCommand::try_from(OpCodePair { ogf, ocf }).unwrap());
    }

    #[test]
    fn opcode_round_trip() {
        let commands = [
            HciCommand::LinkControl(LinkControl::CreateConnection),
            HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset),
            HciCommand::InformationParameters(InformationParameters::ReadBdAddr),
            HciCommand::LEController(LEController::ExtendedCreateConnection),
            HciCommand::VendorSpecific(VendorSpecific::LeMultiAdvt),
        ];

        for command in commands {
            assert_eq!(command, HciCommand::try_from_opcode(command.into_opcode()).unwrap());
        }
    }
}
