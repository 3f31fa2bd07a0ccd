use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::scheduler::Priority;

/// Length of the fixed frame header: magic, type code and argument block length.
pub const HEADER_LEN: usize = 12;

/// Separator between arguments inside the argument block.
pub const ARG_SEPARATOR: u8 = 0;

/// Direction marker in the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub const REQUEST_BYTES: [u8; 4] = *b"\0REQ";
    pub const RESPONSE_BYTES: [u8; 4] = *b"\0RES";

    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Request => &Self::REQUEST_BYTES,
            Magic::Response => &Self::RESPONSE_BYTES,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes == Self::REQUEST_BYTES {
            Some(Magic::Request)
        } else if bytes == Self::RESPONSE_BYTES {
            Some(Magic::Response)
        } else {
            None
        }
    }
}

macro_rules! packet_types {
    ($($variant:ident = $code:literal, $name:literal, $arity:literal;)*) => {
        /// Packet type codes. The numeric values are fixed by the wire protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u32)]
        pub enum PacketType {
            $($variant = $code,)*
        }

        impl PacketType {
            /// Every packet type this crate understands.
            pub const ALL: &'static [PacketType] = &[$(PacketType::$variant,)*];

            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(PacketType::$variant),)*
                    _ => None,
                }
            }

            /// Protocol name, e.g. `SUBMIT_JOB`.
            pub fn name(self) -> &'static str {
                match self {
                    $(PacketType::$variant => $name,)*
                }
            }

            /// Number of arguments a frame of this type carries.
            pub fn arity(self) -> usize {
                match self {
                    $(PacketType::$variant => $arity,)*
                }
            }
        }
    };
}

packet_types! {
    CanDo = 1, "CAN_DO", 1;
    CantDo = 2, "CANT_DO", 1;
    ResetAbilities = 3, "RESET_ABILITIES", 0;
    PreSleep = 4, "PRE_SLEEP", 0;
    Noop = 6, "NOOP", 0;
    SubmitJob = 7, "SUBMIT_JOB", 3;
    JobCreated = 8, "JOB_CREATED", 1;
    GrabJob = 9, "GRAB_JOB", 0;
    NoJob = 10, "NO_JOB", 0;
    JobAssign = 11, "JOB_ASSIGN", 3;
    WorkStatus = 12, "WORK_STATUS", 3;
    WorkComplete = 13, "WORK_COMPLETE", 2;
    WorkFail = 14, "WORK_FAIL", 1;
    GetStatus = 15, "GET_STATUS", 1;
    EchoReq = 16, "ECHO_REQ", 1;
    EchoRes = 17, "ECHO_RES", 1;
    SubmitJobBg = 18, "SUBMIT_JOB_BG", 3;
    Error = 19, "ERROR", 2;
    StatusRes = 20, "STATUS_RES", 5;
    SubmitJobHigh = 21, "SUBMIT_JOB_HIGH", 3;
    SetClientId = 22, "SET_CLIENT_ID", 1;
    CanDoTimeout = 23, "CAN_DO_TIMEOUT", 2;
    WorkException = 25, "WORK_EXCEPTION", 2;
    OptionReq = 26, "OPTION_REQ", 1;
    OptionRes = 27, "OPTION_RES", 1;
    WorkData = 28, "WORK_DATA", 2;
    WorkWarning = 29, "WORK_WARNING", 2;
    GrabJobUniq = 30, "GRAB_JOB_UNIQ", 0;
    JobAssignUniq = 31, "JOB_ASSIGN_UNIQ", 4;
    SubmitJobHighBg = 32, "SUBMIT_JOB_HIGH_BG", 3;
    SubmitJobLow = 33, "SUBMIT_JOB_LOW", 3;
    SubmitJobLowBg = 34, "SUBMIT_JOB_LOW_BG", 3;
}

impl PacketType {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Priority class and background flag for the submit family.
    pub fn submit_mode(self) -> Option<(Priority, bool)> {
        match self {
            PacketType::SubmitJob => Some((Priority::Normal, false)),
            PacketType::SubmitJobBg => Some((Priority::Normal, true)),
            PacketType::SubmitJobHigh => Some((Priority::High, false)),
            PacketType::SubmitJobHighBg => Some((Priority::High, true)),
            PacketType::SubmitJobLow => Some((Priority::Low, false)),
            PacketType::SubmitJobLowBg => Some((Priority::Low, true)),
            _ => None,
        }
    }

    /// The submit packet for a priority class and background flag.
    pub fn for_submit(priority: Priority, background: bool) -> Self {
        match (priority, background) {
            (Priority::Normal, false) => PacketType::SubmitJob,
            (Priority::Normal, true) => PacketType::SubmitJobBg,
            (Priority::High, false) => PacketType::SubmitJobHigh,
            (Priority::High, true) => PacketType::SubmitJobHighBg,
            (Priority::Low, false) => PacketType::SubmitJobLow,
            (Priority::Low, true) => PacketType::SubmitJobLowBg,
        }
    }

    /// Requests the broker answers directly. Protocol errors on these are
    /// reported with an ERROR frame; on anything else they are only logged.
    pub fn expects_response(self) -> bool {
        self.submit_mode().is_some()
            || matches!(
                self,
                PacketType::GrabJob
                    | PacketType::GrabJobUniq
                    | PacketType::GetStatus
                    | PacketType::EchoReq
                    | PacketType::OptionReq
            )
    }

    /// Worker reports that are relayed to the job's watchers.
    pub fn is_work_report(self) -> bool {
        matches!(
            self,
            PacketType::WorkStatus
                | PacketType::WorkData
                | PacketType::WorkWarning
                | PacketType::WorkComplete
                | PacketType::WorkFail
                | PacketType::WorkException
        )
    }

    /// Reports that end a job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PacketType::WorkComplete | PacketType::WorkFail | PacketType::WorkException
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol frame. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    magic: Magic,
    packet: PacketType,
    args: Vec<Bytes>,
}

impl Frame {
    /// Arguments must not contain the NUL separator.
    pub fn new(magic: Magic, packet: PacketType, args: Vec<Bytes>) -> Self {
        debug_assert!(
            args.iter().all(|a| !a.contains(&ARG_SEPARATOR)),
            "frame arguments must not contain NUL"
        );
        Self {
            magic,
            packet,
            args,
        }
    }

    pub fn request<I, A>(packet: PacketType, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Self::new(
            Magic::Request,
            packet,
            args.into_iter().map(Into::into).collect(),
        )
    }

    pub fn response<I, A>(packet: PacketType, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Self::new(
            Magic::Response,
            packet,
            args.into_iter().map(Into::into).collect(),
        )
    }

    /// A frame without arguments.
    pub fn bare(magic: Magic, packet: PacketType) -> Self {
        Self::new(magic, packet, Vec::new())
    }

    /// ERROR response carrying a code and message.
    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            Magic::Response,
            PacketType::Error,
            vec![
                Bytes::copy_from_slice(code.as_bytes()),
                Bytes::copy_from_slice(message.as_bytes()),
            ],
        )
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn packet(&self) -> PacketType {
        self.packet
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// The same type and arguments under a different magic. Used to relay
    /// worker reports to watchers verbatim.
    pub fn with_magic(&self, magic: Magic) -> Self {
        Self {
            magic,
            packet: self.packet,
            args: self.args.clone(),
        }
    }

    /// Size of the NUL-joined argument block.
    pub fn body_len(&self) -> usize {
        let data: usize = self.args.iter().map(Bytes::len).sum();
        data + self.args.len().saturating_sub(1)
    }

    /// Arguments checked against the packet's arity.
    ///
    /// An empty block cannot distinguish zero arguments from one empty
    /// argument, so a one-argument packet with an empty block yields a single
    /// empty argument.
    pub fn expect_args(&self) -> Result<Vec<Bytes>, ProtocolError> {
        let expected = self.packet.arity();
        if self.args.len() == expected {
            return Ok(self.args.clone());
        }
        if expected == 1 && self.args.is_empty() {
            return Ok(vec![Bytes::new()]);
        }
        Err(ProtocolError::WrongArgumentCount {
            packet: self.packet,
            expected,
            got: self.args.len(),
        })
    }
}

/// Decode an argument as UTF-8 text.
pub fn text_arg(packet: PacketType, arg: &Bytes) -> Result<String, ProtocolError> {
    std::str::from_utf8(arg)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidArgument {
            packet,
            detail: "argument is not valid UTF-8".to_string(),
        })
}

/// Decode a decimal numeric argument.
pub fn number_arg(packet: PacketType, arg: &Bytes) -> Result<u64, ProtocolError> {
    let text = text_arg(packet, arg)?;
    text.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidArgument {
            packet,
            detail: format!("{:?} is not a number", text),
        })
}

/// Decode a job handle argument. Handles are non-empty text.
pub fn handle_arg(packet: PacketType, arg: &Bytes) -> Result<String, ProtocolError> {
    let handle = text_arg(packet, arg)?;
    if handle.is_empty() {
        return Err(ProtocolError::InvalidArgument {
            packet,
            detail: "empty job handle".to_string(),
        });
    }
    Ok(handle)
}
