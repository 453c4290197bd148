//! Per-source record parser: type registry and handler dispatch.
//!
//! Each session owns one parser. Producers register their record schemas
//! in-band; the registration payload carries the type name plus the DLT
//! identity it was produced under:
//!
//! ```text
//! version: [0u8; 4] ‖ ecu_id: [u8; 4] ‖ app_id: [u8; 4]
//! ‖ name_len: u32 LE ‖ name bytes
//! ```
//!
//! Because registration is not idempotent, the same name may arrive under
//! several ids; each gets its own index entry and the handlers registered
//! for the name apply to all of them.

use crate::config::{NvConfig, NvMsgDescriptor};
use crate::dlt::DltId;
use ringflip::{SharedRecord, TypeId, TypeRegistration};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Resolved metadata for one registered type id.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Registered type name.
    pub type_name: String,
    /// ECU the producer claims.
    pub ecu_id: DltId,
    /// Application id the producer claims.
    pub app_id: DltId,
    /// Non-verbose descriptor, when the configuration knows the name.
    pub nv_desc: Option<NvMsgDescriptor>,
}

/// Handler for records of one registered type name.
pub trait TypeHandler: Send + Sync {
    fn handle(&self, timestamp_ns: u64, payload: &[u8]);
}

/// Handler invoked for every record regardless of type.
pub trait GlobalHandler: Send + Sync {
    fn handle(&self, info: &TypeInfo, timestamp_ns: u64, payload: &[u8]);
}

struct IndexParser {
    info: Arc<TypeInfo>,
    handlers: Vec<Arc<dyn TypeHandler>>,
}

/// Type registry and dispatcher for one source.
pub struct LogParser {
    nv_config: Arc<NvConfig>,
    // name -> all ids registered under it
    typename_to_index: HashMap<String, Vec<TypeId>>,
    index_parsers: HashMap<TypeId, IndexParser>,
    // name -> handlers wanting records of it
    type_handlers: HashMap<String, Vec<Arc<dyn TypeHandler>>>,
    global_handlers: Vec<Arc<dyn GlobalHandler>>,
}

impl LogParser {
    pub fn new(nv_config: Arc<NvConfig>) -> Self {
        Self {
            nv_config,
            typename_to_index: HashMap::new(),
            index_parsers: HashMap::new(),
            type_handlers: HashMap::new(),
            global_handlers: Vec::new(),
        }
    }

    /// Indexes one registration record.
    pub fn add_incoming_type(&mut self, registration: &TypeRegistration<'_>) {
        let Some((type_name, ecu_id, app_id)) = decode_registration(registration.data) else {
            warn!(type_id = registration.type_id, "malformed type registration skipped");
            return;
        };

        let nv_desc = self.nv_config.get(&type_name).cloned();
        let info = Arc::new(TypeInfo {
            type_name,
            ecu_id,
            app_id,
            nv_desc,
        });

        let handlers = self
            .type_handlers
            .get(&info.type_name)
            .cloned()
            .unwrap_or_default();

        self.typename_to_index
            .entry(info.type_name.clone())
            .or_default()
            .push(registration.type_id);
        self.index_parsers
            .insert(registration.type_id, IndexParser { info, handlers });
    }

    /// Registers a handler for a type name, also wiring it into every id
    /// already registered under that name. Duplicate registrations of the
    /// same handler instance are ignored.
    pub fn add_type_handler(&mut self, type_name: &str, handler: Arc<dyn TypeHandler>) {
        let handlers = self.type_handlers.entry(type_name.to_string()).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        handlers.push(Arc::clone(&handler));

        if let Some(ids) = self.typename_to_index.get(type_name) {
            for id in ids {
                if let Some(parser) = self.index_parsers.get_mut(id) {
                    parser.handlers.push(Arc::clone(&handler));
                }
            }
        }
    }

    /// Removes a type handler from the name and from every indexed id.
    pub fn remove_type_handler(&mut self, type_name: &str, handler: &Arc<dyn TypeHandler>) {
        if let Some(handlers) = self.type_handlers.get_mut(type_name) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
        if let Some(ids) = self.typename_to_index.get(type_name) {
            for id in ids {
                if let Some(parser) = self.index_parsers.get_mut(id) {
                    parser.handlers.retain(|h| !Arc::ptr_eq(h, handler));
                }
            }
        }
    }

    /// Registers a handler for every record; duplicates ignored.
    pub fn add_global_handler(&mut self, handler: Arc<dyn GlobalHandler>) {
        if !self.global_handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.global_handlers.push(handler);
        }
    }

    pub fn remove_global_handler(&mut self, handler: &Arc<dyn GlobalHandler>) {
        self.global_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Drops the per-source index (handlers stay registered).
    pub fn reset_index(&mut self) {
        self.typename_to_index.clear();
        self.index_parsers.clear();
    }

    /// Dispatches one record to its type handlers and the global handlers.
    ///
    /// Records of unknown ids are dropped silently; the producer either
    /// never registered the type or the registration was lost to a full
    /// ring, which it accounts for itself.
    pub fn parse_record(&self, record: &SharedRecord<'_>) {
        let Some(parser) = self.index_parsers.get(&record.header.type_id) else {
            return;
        };

        for handler in &parser.handlers {
            handler.handle(record.header.timestamp_ns, record.payload);
        }
        for handler in &self.global_handlers {
            handler.handle(&parser.info, record.header.timestamp_ns, record.payload);
        }
    }

    /// Type info registered for an id, if any (diagnostics).
    pub fn type_info(&self, id: TypeId) -> Option<&TypeInfo> {
        self.index_parsers.get(&id).map(|p| &*p.info)
    }
}

/// Builds registration bytes in the wire layout producers send.
pub fn encode_registration(ecu_id: DltId, app_id: DltId, type_name: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(16 + type_name.len());
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&ecu_id.0);
    data.extend_from_slice(&app_id.0);
    data.extend_from_slice(&(type_name.len() as u32).to_le_bytes());
    data.extend_from_slice(type_name.as_bytes());
    data
}

fn decode_registration(data: &[u8]) -> Option<(String, DltId, DltId)> {
    if data.len() < 16 || data[0..4] != [0; 4] {
        return None;
    }
    let mut ecu = [0u8; 4];
    ecu.copy_from_slice(&data[4..8]);
    let mut app = [0u8; 4];
    app.copy_from_slice(&data[8..12]);
    let name_len = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
    if name_len > data.len() - 16 {
        return None;
    }
    let name = String::from_utf8_lossy(&data[16..16 + name_len]).into_owned();
    Some((name, DltId(ecu), DltId(app)))
}
