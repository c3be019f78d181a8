//! SFTPv3 packet type, status and flag constants.
//!
//! Plain `repr` enums with a `TryFrom<u32/u8>` and a `Display` impl that
//! renders both the name and the numeric value.

use crate::error::ProtoError;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident : $repr:ty, $err:expr => { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<$repr> for $name {
            type Error = ProtoError;

            fn try_from(value: $repr) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err($err(other.into())),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> $repr {
                value as $repr
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let name = match self {
                    $($name::$variant => stringify!($variant)),+
                };
                write!(f, "{name} ({:#x})", *self as $repr)
            }
        }
    };
}

wire_enum! {
    /// Client-to-server and server-to-client SFTPv3 packet types, plus the
    /// reserved vendor "Dirligo" extension range (220-224).
    PacketType: u8, ProtoError::UnknownPacketType => {
        Init = 1,
        Version = 2,
        Open = 3,
        Close = 4,
        Read = 5,
        Write = 6,
        /// Also used as `STAT_VERSION_0` for the `stat` request.
        Lstat = 7,
        Fstat = 8,
        Setstat = 9,
        Fsetstat = 10,
        Opendir = 11,
        Readdir = 12,
        Remove = 13,
        Mkdir = 14,
        Rmdir = 15,
        Realpath = 16,
        Stat = 17,
        Rename = 18,
        Readlink = 19,
        Symlink = 20,
        Status = 101,
        Handle = 102,
        Data = 103,
        Name = 104,
        Attrs = 105,
        Extended = 200,
        ExtendedReply = 201,
        DirligoCreatefile = 220,
        DirligoMulticlose = 221,
        DirligoResetdir = 222,
        DirligoAppend = 223,
        DirligoReaddirShort = 224,
    }
}

wire_enum! {
    /// SFTPv3 `SSH_FXP_STATUS` codes.
    Status: u32, ProtoError::UnknownStatus => {
        Ok = 0,
        Eof = 1,
        NoSuchFile = 2,
        PermissionDenied = 3,
        Failure = 4,
        BadMessage = 5,
        NoConnection = 6,
        ConnectionLost = 7,
        OpUnsupported = 8,
    }
}

/// Attribute flag bits.
pub mod attr_flags {
    pub const SIZE: u32 = 0x0000_0001;
    pub const UIDGID: u32 = 0x0000_0002;
    pub const PERMISSIONS: u32 = 0x0000_0004;
    pub const ACMODTIME: u32 = 0x0000_0008;
    pub const EXTENDED: u32 = 0x8000_0000;
}

/// Portable open-mode flag bits.
pub mod open_flags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;
}

/// `statvfs@openssh.com` `f_flag` bits.
pub mod statvfs_flags {
    pub const ST_RDONLY: u64 = 0x0000_0001;
    pub const ST_NOSUID: u64 = 0x0000_0002;
}

/// High bit of a `CREATEFILE` handle indicating the handle refers to a
/// directory. Must be masked out of the handle value
/// returned to callers.
pub const DIRLIGO_DIR_FLAG: i32 = 0x4000_0000;

pub const SSH2_FILEXFER_VERSION: u32 = 3;

/// Default sector size for `read`/`write`: 32 KiB.
pub const DEFAULT_SECTOR_SIZE: usize = 32 * 1024;

/// Default statistics-tick interval: every 128 completed requests.
pub const DEFAULT_NETSTAT_TICK: u32 = 128;

/// Default partial-read/write thresholds, in seconds.
pub const DEFAULT_PARTIAL_IO_TIMEOUT_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_round_trips() {
        assert_eq!(PacketType::try_from(221u8).unwrap(), PacketType::DirligoMulticlose);
        assert_eq!(u8::from(PacketType::DirligoMulticlose), 221);
    }

    #[test]
    fn status_round_trips() {
        assert_eq!(Status::try_from(1u32).unwrap(), Status::Eof);
        assert!(Status::try_from(999u32).is_err());
    }

    #[test]
    fn dir_flag_has_expected_bit() {
        assert_eq!(DIRLIGO_DIR_FLAG, 0x4000_0000);
    }
}
