//! Shared fixtures: an in-memory marking library that records every call.

#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use ezcad_automation::ffi::{DocumentMode, MarkingLibrary, VendorStatus};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// One foreign call as seen by [`FakeLibrary`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Initialize(Utf8PathBuf),
    Close,
    Save(Utf8PathBuf),
    MarkEntity(String),
    MarkAll(bool),
    EntityCount,
    EntityName(i32),
    SetText(String, String),
    EntityType(String),
    Indicator(f64, f64),
}

/// Handle for inspecting calls after the library moved into a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }
}

/// In-memory document with named text entities.
#[derive(Debug, Clone, Default)]
pub struct FakeLibrary {
    /// Entity name → (type code, text).
    pub entities: IndexMap<String, (i32, String)>,
    pub open_status: VendorStatus,
    pub fail_mark: bool,
    pub fail_save: bool,
    /// Texts the library refuses to set.
    pub rejected_texts: HashSet<String>,
    /// Indexes whose name cannot be read.
    pub unreadable_names: HashSet<i32>,
    pub log: CallLog,
}

impl FakeLibrary {
    pub fn with_entities(names: &[&str]) -> Self {
        Self {
            entities: names
                .iter()
                .map(|name| (name.to_string(), (0, String::new())))
                .collect(),
            ..Default::default()
        }
    }

    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.entities.get(name).map(|(_, text)| text.as_str())
    }
}

impl MarkingLibrary for FakeLibrary {
    fn initialize(&mut self, document: &Utf8Path, _mode: DocumentMode) -> VendorStatus {
        self.log.push(Call::Initialize(document.to_path_buf()));
        self.open_status
    }

    fn close(&mut self) -> VendorStatus {
        self.log.push(Call::Close);
        VendorStatus::SUCCESS
    }

    fn save_to_file(&mut self, destination: &Utf8Path) -> VendorStatus {
        self.log.push(Call::Save(destination.to_path_buf()));
        if self.fail_save {
            VendorStatus(6)
        } else {
            VendorStatus::SUCCESS
        }
    }

    fn mark_entity(&mut self, name: &str) -> VendorStatus {
        self.log.push(Call::MarkEntity(name.to_string()));
        if self.fail_mark || !self.entities.contains_key(name) {
            VendorStatus(3)
        } else {
            VendorStatus::SUCCESS
        }
    }

    fn mark_all(&mut self, fly_mark: bool) -> VendorStatus {
        self.log.push(Call::MarkAll(fly_mark));
        if self.fail_mark {
            VendorStatus(3)
        } else {
            VendorStatus::SUCCESS
        }
    }

    fn entity_count(&mut self) -> (i32, VendorStatus) {
        self.log.push(Call::EntityCount);
        (self.entities.len() as i32, VendorStatus::SUCCESS)
    }

    fn entity_name(&mut self, index: i32) -> (String, VendorStatus) {
        self.log.push(Call::EntityName(index));
        if self.unreadable_names.contains(&index) {
            return (String::new(), VendorStatus(5));
        }
        match self.entities.get_index(index as usize) {
            Some((name, _)) => (name.clone(), VendorStatus::SUCCESS),
            None => (String::new(), VendorStatus(5)),
        }
    }

    fn set_entity_text(&mut self, name: &str, text: &str) -> VendorStatus {
        self.log.push(Call::SetText(name.to_string(), text.to_string()));
        if self.rejected_texts.contains(text) {
            return VendorStatus(8);
        }
        match self.entities.get_mut(name) {
            Some((_, current)) => {
                *current = text.to_string();
                VendorStatus::SUCCESS
            }
            None => VendorStatus(2),
        }
    }

    fn entity_type(&mut self, name: &str) -> (i32, VendorStatus) {
        self.log.push(Call::EntityType(name.to_string()));
        match self.entities.get(name) {
            Some((entity_type, _)) => (*entity_type, VendorStatus::SUCCESS),
            None => (0, VendorStatus(2)),
        }
    }

    fn position_indicator(&mut self, x: f64, y: f64, _machine_coordinates: bool) -> bool {
        self.log.push(Call::Indicator(x, y));
        x.is_finite() && y.is_finite()
    }

    fn read_port(&mut self, _port: u16) -> (u16, VendorStatus) {
        (0, VendorStatus::SUCCESS)
    }

    fn write_port(&mut self, _port: u16, _value: u16) -> VendorStatus {
        VendorStatus::SUCCESS
    }
}

/// An empty file standing in for an EZD template.
pub fn temp_template() -> (NamedTempFile, Utf8PathBuf) {
    let file = tempfile::Builder::new().suffix(".ezd").tempfile().unwrap();
    let path = Utf8PathBuf::try_from(file.path().to_path_buf()).unwrap();
    (file, path)
}
