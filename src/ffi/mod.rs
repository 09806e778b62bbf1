//! Foreign function interface to the EZCAD2 marking library.
//!
//! [`MarkingLibrary`] is the seam between the command dispatcher and the vendor
//! `MarkEzd.dll`. Every method is a direct pass-through: no retries, no
//! validation, no interpretation of status codes beyond wrapping them in
//! [`VendorStatus`]. Session discipline (never touching entities before a
//! document is open) is the dispatcher's job, not this layer's.
//!
//! [`MarkEzdLibrary`] is the production implementation over the real DLL.
//! Tests substitute the `mockall` generated `MockMarkingLibrary` or a
//! hand-written fake.

pub mod markezd;

pub use markezd::MarkEzdLibrary;

use camino::Utf8Path;
use std::fmt;
use thiserror::Error;

/// Size (in UTF-16 units) of the buffer the vendor writes entity names into.
pub const ENTITY_NAME_CAPACITY: usize = 256;

/// Raw status code returned by a vendor call. `0` means success; every other
/// value is vendor-defined and surfaced as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VendorStatus(pub i32);

impl VendorStatus {
    pub const SUCCESS: VendorStatus = VendorStatus(0);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for VendorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether `initialize` should load an existing document or start a blank one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentMode {
    Open,
    New,
}

/// Errors raised while loading the vendor library itself.
///
/// Individual calls never fail at this level; they return a [`VendorStatus`].
#[derive(Error, Debug)]
pub enum FfiError {
    #[error("Failed to load marking library {path}: {source}")]
    LibraryLoad {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("Entry point {symbol} not found in marking library: {source}")]
    SymbolNotFound {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },
}

/// The fixed set of native entry points exposed by the marking library.
#[cfg_attr(test, mockall::automock)]
pub trait MarkingLibrary {
    /// Initialize the library with a document. Must precede every other
    /// document operation.
    fn initialize(&mut self, document: &Utf8Path, mode: DocumentMode) -> VendorStatus;

    /// Release the library. Safe to call when never initialized.
    fn close(&mut self) -> VendorStatus;

    /// Write the in-memory document to `destination`.
    fn save_to_file(&mut self, destination: &Utf8Path) -> VendorStatus;

    /// Run the marking process for a single named entity.
    fn mark_entity(&mut self, name: &str) -> VendorStatus;

    /// Run the marking process for the whole document.
    fn mark_all(&mut self, fly_mark: bool) -> VendorStatus;

    fn entity_count(&mut self) -> (i32, VendorStatus);

    /// Name of the entity at `index`, decoded from a
    /// [`ENTITY_NAME_CAPACITY`]-sized buffer.
    fn entity_name(&mut self, index: i32) -> (String, VendorStatus);

    /// Replace the text of a text-capable entity.
    fn set_entity_text(&mut self, name: &str, text: &str) -> VendorStatus;

    fn entity_type(&mut self, name: &str) -> (i32, VendorStatus);

    /// Move the red-light indicator. `machine_coordinates = false` means
    /// document space.
    fn position_indicator(&mut self, x: f64, y: f64, machine_coordinates: bool) -> bool;

    fn read_port(&mut self, port: u16) -> (u16, VendorStatus);

    fn write_port(&mut self, port: u16, value: u16) -> VendorStatus;
}
