//! Wire protocol: command space, framing, and the per-connection machines.
//!
//! Frames are little-endian throughout:
//!
//! ```text
//!   u32  command          (high byte = command class)
//!   u32  length           (bytes of body that follow)
//!   u8   body[length]
//! ```
//!
//! The command class selects the routing prefix at the start of the body:
//! Plain frames carry none and are processed on arrival, Server frames carry
//! destination server + sender ids, Term frames carry destination terminal +
//! sender client ids, and Client frames carry the destination client id.

pub mod attrs;
pub mod handshake;
pub mod machine;
pub mod wire;

/// Size of the fixed frame header (command + length).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 1;
/// Client version reported on a successful handshake.
pub const CLIENT_VERSION: u32 = 1;

/// Requested protocol types in the handshake response.
pub const PROTOCOL_REJECT: u32 = 0;
pub const PROTOCOL_TERM: u32 = 1;
pub const PROTOCOL_RAW: u32 = 2;

/// Command classes, carried in the top byte of the command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
  /// No routing prefix; handled by the receiving worker.
  Plain,
  /// Prefix: destination server id + sender id.
  Server,
  /// Prefix: destination terminal id + sender client id.
  Term,
  /// Prefix: destination client id.
  Client,
}

impl CommandClass {
  #[must_use]
  pub const fn of(command: u32) -> Option<Self> {
    match command >> 24 {
      0x00 => Some(Self::Plain),
      0x01 => Some(Self::Server),
      0x02 => Some(Self::Term),
      0x03 => Some(Self::Client),
      _ => None,
    }
  }

  /// Number of routing-prefix bytes at the start of the body.
  #[must_use]
  pub const fn prefix_size(self) -> usize {
    match self {
      Self::Plain => 0,
      Self::Server | Self::Term => 32,
      Self::Client => 16,
    }
  }
}

// Plain commands.
pub const KEEPALIVE: u32 = 0x0000_0001;
pub const CONFIGURE_KEEPALIVE: u32 = 0x0000_0002;
pub const CHANNEL_TEST: u32 = 0x0000_0003;
pub const DISCONNECT: u32 = 0x0000_0004;
pub const THROTTLE_PAUSE: u32 = 0x0000_0005;
pub const THROTTLE_RESUME: u32 = 0x0000_0006;
pub const ANNOUNCE_SERVER: u32 = 0x0000_0010;
pub const REMOVE_SERVER: u32 = 0x0000_0011;
pub const ANNOUNCE_TERM: u32 = 0x0000_0012;
pub const REMOVE_TERM: u32 = 0x0000_0013;
pub const ANNOUNCE_CLIENT: u32 = 0x0000_0014;
pub const REMOVE_CLIENT: u32 = 0x0000_0015;

// Server commands (prefix: destination server id, sender id).
pub const GET_SERVER_ATTRIBUTE: u32 = 0x0100_0001;
pub const SET_SERVER_ATTRIBUTE: u32 = 0x0100_0002;
pub const REMOVE_SERVER_ATTRIBUTE: u32 = 0x0100_0003;
pub const CREATE_TERM: u32 = 0x0100_0004;
pub const MONITOR_INPUT: u32 = 0x0100_0005;
pub const TASK_INPUT: u32 = 0x0100_0010;
pub const TASK_ANSWER: u32 = 0x0100_0011;
pub const TASK_CANCEL: u32 = 0x0100_0012;
pub const TASK_FILE_DOWNLOAD: u32 = 0x0100_0020;
pub const TASK_FILE_UPLOAD: u32 = 0x0100_0021;
pub const TASK_PIPE_DOWNLOAD: u32 = 0x0100_0022;
pub const TASK_PIPE_UPLOAD: u32 = 0x0100_0023;
pub const TASK_RUN_COMMAND: u32 = 0x0100_0024;
pub const TASK_PORT_OUT: u32 = 0x0100_0025;
pub const TASK_PORT_IN: u32 = 0x0100_0026;
pub const TASK_MOUNT_RO: u32 = 0x0100_0027;
pub const TASK_MOUNT_RW: u32 = 0x0100_0028;
pub const TASK_FILE_DELETE: u32 = 0x0100_0029;
pub const TASK_FILE_RENAME: u32 = 0x0100_002A;

// Term commands (prefix: destination terminal id, sender client id).
pub const TERM_INPUT: u32 = 0x0200_0001;
pub const TERM_RESIZE: u32 = 0x0200_0002;
pub const TERM_RESET: u32 = 0x0200_0003;
pub const TERM_SIGNAL: u32 = 0x0200_0004;
pub const TERM_MOUSE_MOVE: u32 = 0x0200_0005;
pub const TERM_GET_ROWS: u32 = 0x0200_0006;
pub const TERM_GET_REGION: u32 = 0x0200_0007;
pub const TERM_CREATE_REGION: u32 = 0x0200_0008;
pub const TERM_REMOVE_REGION: u32 = 0x0200_0009;
pub const TERM_SET_ATTRIBUTE: u32 = 0x0200_000A;
pub const TERM_REMOVE_ATTRIBUTE: u32 = 0x0200_000B;
pub const TERM_GET_ATTRIBUTE: u32 = 0x0200_000C;
pub const TERM_RESIZE_BUFFER: u32 = 0x0200_000D;
pub const TERM_UPDATE_ENVIRON: u32 = 0x0200_000E;
pub const TERM_CLOSE: u32 = 0x0200_000F;
pub const TERM_DUPLICATE: u32 = 0x0200_0010;
pub const TERM_REQUEST_OWNERSHIP: u32 = 0x0200_0011;
pub const TERM_SCROLL_LOCK: u32 = 0x0200_0012;
pub const TERM_GET_CONTENT: u32 = 0x0200_0013;

// Client commands (prefix: destination client id).
pub const CLIENT_TASK_OUTPUT: u32 = 0x0300_0001;
pub const CLIENT_TASK_QUESTION: u32 = 0x0300_0002;
pub const CLIENT_ROW_DATA: u32 = 0x0300_0003;
pub const CLIENT_REGION_DATA: u32 = 0x0300_0004;
pub const CLIENT_ATTRIBUTE: u32 = 0x0300_0005;
pub const CLIENT_OWNERSHIP: u32 = 0x0300_0006;
pub const CLIENT_FILE_UPDATE: u32 = 0x0300_0007;
pub const CLIENT_DIRECTORY_UPDATE: u32 = 0x0300_0008;
pub const CLIENT_TERM_STATE: u32 = 0x0300_0009;

/// Connection and close status codes.
pub const STATUS_NORMAL: u32 = 0;
pub const STATUS_SERVER_SHUTDOWN: u32 = 1;
pub const STATUS_LOST_CONN: u32 = 2;
pub const STATUS_IDLE_TIMEOUT: u32 = 3;
pub const STATUS_PROTOCOL_ERROR: u32 = 4;
pub const STATUS_DUPLICATE_CONN: u32 = 5;
pub const STATUS_SERVER_ERROR: u32 = 6;
pub const STATUS_PROTOCOL_MISMATCH: u32 = 7;
pub const STATUS_REJECT: u32 = 8;

/// Handshake clientVersion values in the reserved range signal rejection.
pub const VERSION_REJECT_BASE: u32 = 0xFFFF_FF00;
pub const VERSION_PROTOCOL_MISMATCH: u32 = 0xFFFF_FF01;
pub const VERSION_DUPLICATE_CONN: u32 = 0xFFFF_FF02;
pub const VERSION_REJECT: u32 = 0xFFFF_FF03;

/// Task lifecycle statuses carried in the task output header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskStatus {
  Starting = 0,
  Running = 1,
  Acking = 2,
  Question = 3,
  Finished = 4,
  Error = 5,
}

impl TaskStatus {
  #[must_use]
  pub const fn from_u32(value: u32) -> Option<Self> {
    match value {
      0 => Some(Self::Starting),
      1 => Some(Self::Running),
      2 => Some(Self::Acking),
      3 => Some(Self::Question),
      4 => Some(Self::Finished),
      5 => Some(Self::Error),
      _ => None,
    }
  }
}

/// Task error kinds carried in error reports alongside a strerror string.
pub const TASK_ERROR_OPEN_FAILED: u32 = 1;
pub const TASK_ERROR_READ_FAILED: u32 = 2;
pub const TASK_ERROR_WRITE_FAILED: u32 = 3;
pub const TASK_ERROR_FILE_EXISTS: u32 = 4;
pub const TASK_ERROR_FILE_NOT_FOUND: u32 = 5;
pub const TASK_ERROR_REMOVE_FAILED: u32 = 6;
pub const TASK_ERROR_RENAME_FAILED: u32 = 7;
pub const TASK_ERROR_INVALID_NAME: u32 = 8;
pub const TASK_ERROR_NO_SUCH_IMAGE: u32 = 9;
pub const TASK_ERROR_TIMED_OUT: u32 = 10;
pub const TASK_ERROR_CANCELED: u32 = 11;
pub const TASK_ERROR_DUPLICATE: u32 = 12;
pub const TASK_ERROR_LOST_CONN: u32 = 13;
pub const TASK_ERROR_FORK_FAILED: u32 = 14;
pub const TASK_ERROR_CONNECT_FAILED: u32 = 15;

/// Overwrite-conflict configuration and answer codes.
pub const TASK_ASK: u32 = 0;
pub const TASK_OVERWRITE: u32 = 1;
pub const TASK_RENAME: u32 = 2;
pub const TASK_FAIL: u32 = 3;
pub const TASK_ASK_RECURSE: u32 = 4;

/// Questions a task may pose to its owning client.
pub const QUESTION_OVERWRITE_RENAME: u32 = 0;
pub const QUESTION_OVERWRITE: u32 = 1;
pub const QUESTION_REMOVE: u32 = 2;
pub const QUESTION_RECURSE: u32 = 3;

/// Mount operation opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountOp {
  Stat = 0,
  Read = 1,
  Write = 2,
  Append = 3,
  Chmod = 4,
  Trunc = 5,
  Touch = 6,
  Create = 7,
  Open = 8,
  Close = 9,
  Opendir = 10,
  Readdir = 11,
  Closedir = 12,
  Lookup = 13,
}

impl MountOp {
  #[must_use]
  pub const fn from_u32(value: u32) -> Option<Self> {
    match value {
      0 => Some(Self::Stat),
      1 => Some(Self::Read),
      2 => Some(Self::Write),
      3 => Some(Self::Append),
      4 => Some(Self::Chmod),
      5 => Some(Self::Trunc),
      6 => Some(Self::Touch),
      7 => Some(Self::Create),
      8 => Some(Self::Open),
      9 => Some(Self::Close),
      10 => Some(Self::Opendir),
      11 => Some(Self::Readdir),
      12 => Some(Self::Closedir),
      13 => Some(Self::Lookup),
      _ => None,
    }
  }
}

/// Mount operation results.
pub const MOUNT_SUCCESS: u32 = 0;
pub const MOUNT_EXIST: u32 = 1;
pub const MOUNT_FILETYPE: u32 = 2;
pub const MOUNT_FAILURE: u32 = 3;

/// Port forward types.
pub const PORT_FORWARD_TCP: u32 = 0;
pub const PORT_FORWARD_UNIX: u32 = 1;

/// Client registration flags.
pub const FLAG_TAKE_OWNERSHIP: u32 = 1 << 0;

/// Terminal exit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitAction {
  #[default]
  Stop,
  Restart,
  Clear,
}

impl ExitAction {
  #[must_use]
  pub fn from_u32(value: u32) -> Self {
    match value {
      1 => Self::Restart,
      2 => Self::Clear,
      _ => Self::Stop,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn class_decodes_from_top_byte() {
    assert_eq!(CommandClass::of(KEEPALIVE), Some(CommandClass::Plain));
    assert_eq!(CommandClass::of(CREATE_TERM), Some(CommandClass::Server));
    assert_eq!(CommandClass::of(TERM_INPUT), Some(CommandClass::Term));
    assert_eq!(CommandClass::of(CLIENT_TASK_OUTPUT), Some(CommandClass::Client));
    assert_eq!(CommandClass::of(0x7F00_0000), None);
  }

  #[test]
  fn prefix_sizes_match_routing() {
    assert_eq!(CommandClass::Plain.prefix_size(), 0);
    assert_eq!(CommandClass::Server.prefix_size(), 32);
    assert_eq!(CommandClass::Term.prefix_size(), 32);
    assert_eq!(CommandClass::Client.prefix_size(), 16);
  }

  #[test]
  fn task_status_round_trips() {
    for status in [
      TaskStatus::Starting,
      TaskStatus::Running,
      TaskStatus::Acking,
      TaskStatus::Question,
      TaskStatus::Finished,
      TaskStatus::Error,
    ] {
      assert_eq!(TaskStatus::from_u32(status as u32), Some(status));
    }
    assert_eq!(TaskStatus::from_u32(99), None);
  }
}
