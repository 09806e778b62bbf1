use super::{DocumentMode, ENTITY_NAME_CAPACITY, FfiError, MarkingLibrary, VendorStatus};
use camino::{Utf8Path, Utf8PathBuf};
use libloading::Library;
use std::ffi::c_void;
use std::iter;
use std::ptr;

/// Win32 `BOOL`.
type Bool = i32;

type InitialFn = unsafe extern "system" fn(*const u16, Bool, *mut c_void) -> i32;
type VoidFn = unsafe extern "system" fn() -> i32;
type PathFn = unsafe extern "system" fn(*const u16) -> i32;
type MarkFn = unsafe extern "system" fn(Bool) -> i32;
type CountFn = unsafe extern "system" fn() -> i32;
type NameFn = unsafe extern "system" fn(i32, *mut u16) -> i32;
type ChangeTextFn = unsafe extern "system" fn(*const u16, *const u16) -> i32;
type TypeFn = unsafe extern "system" fn(*const u16, *mut i32) -> i32;
type RedLightFn = unsafe extern "system" fn(f64, f64, Bool) -> Bool;
type ReadPortFn = unsafe extern "system" fn(u16, *mut u16) -> i32;
type WritePortFn = unsafe extern "system" fn(u16, u16) -> i32;

/// Exported entry point names.
mod symbols {
    pub const INITIAL: &str = "lmc1_Initial";
    pub const CLOSE: &str = "lmc1_Close";
    pub const LOAD_EZD_FILE: &str = "lmc1_LoadEzdFile";
    pub const CLEAR_ENT_LIB: &str = "lmc1_ClearEntLib";
    pub const SAVE_ENT_LIB: &str = "lmc1_SaveEntLibToFile";
    pub const MARK: &str = "lmc1_Mark";
    pub const MARK_ENTITY: &str = "lmc1_MarkEntity";
    pub const GET_ENTITY_COUNT: &str = "lmc1_GetEntityCount";
    pub const GET_ENTITY_NAME: &str = "lmc1_GetEntityName";
    pub const CHANGE_TEXT_BY_NAME: &str = "lmc1_ChangeTextByName";
    pub const GET_ENTITY_TYPE: &str = "lmc1_GetEntityType";
    pub const RED_LIGHT_POS: &str = "lmc1_RedLightPos";
    pub const READ_PORT: &str = "lmc1_ReadPort";
    pub const WRITE_PORT: &str = "lmc1_WritePort";
}

/// `MarkEzd.dll` loaded through `libloading`.
///
/// All entry points are resolved when the library is loaded, so a missing
/// export is reported once as an [`FfiError`] instead of at first use. The
/// function pointers stay valid for as long as `_library` is alive.
pub struct MarkEzdLibrary {
    install_dir: Utf8PathBuf,
    initial: InitialFn,
    close: VoidFn,
    load_ezd_file: PathFn,
    clear_ent_lib: VoidFn,
    save_ent_lib: PathFn,
    mark: MarkFn,
    mark_entity: PathFn,
    get_entity_count: CountFn,
    get_entity_name: NameFn,
    change_text_by_name: ChangeTextFn,
    get_entity_type: TypeFn,
    red_light_pos: RedLightFn,
    read_port: ReadPortFn,
    write_port: WritePortFn,
    _library: Library,
}

impl MarkEzdLibrary {
    /// Load the marking library from `path` and resolve every entry point.
    ///
    /// The directory containing the DLL is handed to `lmc1_Initial` as the
    /// EZCAD installation directory.
    pub fn load(path: &Utf8Path) -> Result<Self, FfiError> {
        // SAFETY: loading runs the DLL's initialisers; MarkEzd.dll has none
        // with preconditions beyond being on a Windows host.
        let library = unsafe { Library::new(path.as_std_path()) }.map_err(|source| {
            FfiError::LibraryLoad {
                path: path.to_string(),
                source,
            }
        })?;

        let install_dir = path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));

        // SAFETY: each type alias matches the exported declaration in the
        // EZCAD2 SDK header.
        unsafe {
            Ok(Self {
                initial: resolve(&library, symbols::INITIAL)?,
                close: resolve(&library, symbols::CLOSE)?,
                load_ezd_file: resolve(&library, symbols::LOAD_EZD_FILE)?,
                clear_ent_lib: resolve(&library, symbols::CLEAR_ENT_LIB)?,
                save_ent_lib: resolve(&library, symbols::SAVE_ENT_LIB)?,
                mark: resolve(&library, symbols::MARK)?,
                mark_entity: resolve(&library, symbols::MARK_ENTITY)?,
                get_entity_count: resolve(&library, symbols::GET_ENTITY_COUNT)?,
                get_entity_name: resolve(&library, symbols::GET_ENTITY_NAME)?,
                change_text_by_name: resolve(&library, symbols::CHANGE_TEXT_BY_NAME)?,
                get_entity_type: resolve(&library, symbols::GET_ENTITY_TYPE)?,
                red_light_pos: resolve(&library, symbols::RED_LIGHT_POS)?,
                read_port: resolve(&library, symbols::READ_PORT)?,
                write_port: resolve(&library, symbols::WRITE_PORT)?,
                install_dir,
                _library: library,
            })
        }
    }

    pub fn install_dir(&self) -> &Utf8Path {
        &self.install_dir
    }
}

/// Copy a function pointer out of the library.
///
/// # Safety
/// `T` must be the exact `extern "system"` signature of `symbol`.
unsafe fn resolve<T: Copy>(library: &Library, symbol: &'static str) -> Result<T, FfiError> {
    let name = format!("{symbol}\0");
    // SAFETY: forwarded to the caller.
    let found = unsafe { library.get::<T>(name.as_bytes()) };
    found
        .map(|function| *function)
        .map_err(|source| FfiError::SymbolNotFound { symbol, source })
}

/// NUL-terminated UTF-16 copy of `value`.
fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(iter::once(0)).collect()
}

/// Decode a UTF-16 buffer up to its first NUL.
fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&unit| unit == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

fn to_bool(value: bool) -> Bool {
    Bool::from(value)
}

impl MarkingLibrary for MarkEzdLibrary {
    fn initialize(&mut self, document: &Utf8Path, mode: DocumentMode) -> VendorStatus {
        let install_dir = to_wide(self.install_dir.as_str());
        // SAFETY: pointer is NUL-terminated and outlives the call; no owner window.
        let status = unsafe { (self.initial)(install_dir.as_ptr(), to_bool(false), ptr::null_mut()) };
        if status != 0 {
            return VendorStatus(status);
        }

        let status = match mode {
            DocumentMode::Open => {
                let document = to_wide(document.as_str());
                // SAFETY: NUL-terminated buffer outlives the call.
                unsafe { (self.load_ezd_file)(document.as_ptr()) }
            }
            // SAFETY: no arguments.
            DocumentMode::New => unsafe { (self.clear_ent_lib)() },
        };
        VendorStatus(status)
    }

    fn close(&mut self) -> VendorStatus {
        // SAFETY: lmc1_Close tolerates an uninitialised library.
        VendorStatus(unsafe { (self.close)() })
    }

    fn save_to_file(&mut self, destination: &Utf8Path) -> VendorStatus {
        let destination = to_wide(destination.as_str());
        // SAFETY: NUL-terminated buffer outlives the call.
        VendorStatus(unsafe { (self.save_ent_lib)(destination.as_ptr()) })
    }

    fn mark_entity(&mut self, name: &str) -> VendorStatus {
        let name = to_wide(name);
        // SAFETY: NUL-terminated buffer outlives the call.
        VendorStatus(unsafe { (self.mark_entity)(name.as_ptr()) })
    }

    fn mark_all(&mut self, fly_mark: bool) -> VendorStatus {
        // SAFETY: plain value argument.
        VendorStatus(unsafe { (self.mark)(to_bool(fly_mark)) })
    }

    fn entity_count(&mut self) -> (i32, VendorStatus) {
        // SAFETY: no arguments.
        let count = unsafe { (self.get_entity_count)() };
        // The export returns the count itself; negative values are error codes.
        if count < 0 {
            (0, VendorStatus(count))
        } else {
            (count, VendorStatus::SUCCESS)
        }
    }

    fn entity_name(&mut self, index: i32) -> (String, VendorStatus) {
        let mut buffer = [0u16; ENTITY_NAME_CAPACITY];
        // SAFETY: the vendor writes at most ENTITY_NAME_CAPACITY units.
        let status = unsafe { (self.get_entity_name)(index, buffer.as_mut_ptr()) };
        (from_wide(&buffer), VendorStatus(status))
    }

    fn set_entity_text(&mut self, name: &str, text: &str) -> VendorStatus {
        let name = to_wide(name);
        let text = to_wide(text);
        // SAFETY: both buffers are NUL-terminated and outlive the call.
        VendorStatus(unsafe { (self.change_text_by_name)(name.as_ptr(), text.as_ptr()) })
    }

    fn entity_type(&mut self, name: &str) -> (i32, VendorStatus) {
        let name = to_wide(name);
        let mut entity_type = 0i32;
        // SAFETY: name is NUL-terminated; out pointer is a live local.
        let status = unsafe { (self.get_entity_type)(name.as_ptr(), &mut entity_type) };
        (entity_type, VendorStatus(status))
    }

    fn position_indicator(&mut self, x: f64, y: f64, machine_coordinates: bool) -> bool {
        // SAFETY: plain value arguments.
        unsafe { (self.red_light_pos)(x, y, to_bool(machine_coordinates)) != 0 }
    }

    fn read_port(&mut self, port: u16) -> (u16, VendorStatus) {
        let mut value = 0u16;
        // SAFETY: out pointer is a live local.
        let status = unsafe { (self.read_port)(port, &mut value) };
        (value, VendorStatus(status))
    }

    fn write_port(&mut self, port: u16, value: u16) -> VendorStatus {
        // SAFETY: plain value arguments.
        VendorStatus(unsafe { (self.write_port)(port, value) })
    }
}
