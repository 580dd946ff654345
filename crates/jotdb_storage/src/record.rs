//! Line records shared by the forward and reverse readers.

/// One complete line delivered by a streaming pass.
///
/// `position` is the byte offset of the line's first byte in the file as it
/// existed when the pass opened; `length` is the line's byte length without
/// the trailing newline. An in-place overwrite of exactly `length` bytes at
/// `position` replaces the line without shifting any other content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    /// Byte offset of the line start.
    pub position: u64,
    /// Byte length of the line, excluding the newline.
    pub length: usize,
    /// Line content, excluding the newline.
    pub text: String,
}

/// Control value returned by batch callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Keep streaming.
    Continue,
    /// Terminate the pass early.
    Stop,
}
