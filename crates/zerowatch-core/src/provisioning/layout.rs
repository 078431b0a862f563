//! Schema-described encoding of the configuration area
//!
//! The configuration area is a fixed-width header of field lengths followed
//! by the field bytes in schema order. [`encode`] and [`decode_field`] are the
//! only places that know how a record maps onto bytes; the store works purely
//! in terms of offsets derived from a [`FieldHeader`].

use alloc::string::String;
use alloc::vec::Vec;

use super::{
    CONFIG_REGION_SIZE, FIELD_COUNT, HEADER_SIZE, PORT_FIELD_SIZE, ProvisioningError,
    ProvisioningRecord,
};

/// How a field's bytes are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// UTF-8 text, stored without terminator
    Text,
    /// Little-endian u16, always [`PORT_FIELD_SIZE`] bytes
    Port,
}

/// One named, length-prefixed field of the configuration area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Field order of the configuration area. Changing it breaks every
/// provisioned device.
pub const SCHEMA: [FieldSpec; FIELD_COUNT] = [
    FieldSpec {
        name: "wifiSsid",
        kind: FieldKind::Text,
    },
    FieldSpec {
        name: "wifiPassword",
        kind: FieldKind::Text,
    },
    FieldSpec {
        name: "backendHost",
        kind: FieldKind::Text,
    },
    FieldSpec {
        name: "backendPort",
        kind: FieldKind::Port,
    },
    FieldSpec {
        name: "backendPassword",
        kind: FieldKind::Text,
    },
    FieldSpec {
        name: "updateHost",
        kind: FieldKind::Text,
    },
];

/// Decoded value of a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Port(u16),
}

/// Length header of the configuration area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldHeader {
    pub lengths: [u16; FIELD_COUNT],
}

impl FieldHeader {
    /// Converts the header to its on-region representation.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        for (chunk, len) in bytes.chunks_exact_mut(2).zip(self.lengths) {
            chunk.copy_from_slice(&len.to_le_bytes());
        }
        bytes
    }

    /// Creates a header from its on-region representation.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut lengths = [0u16; FIELD_COUNT];
        for (len, chunk) in lengths.iter_mut().zip(bytes.chunks_exact(2)) {
            *len = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Self { lengths }
    }

    /// Total bytes of field data following the header
    pub fn payload_len(&self) -> usize {
        self.lengths.iter().map(|&l| l as usize).sum()
    }

    /// Offset of each field relative to the end of the header
    pub fn offsets(&self) -> [usize; FIELD_COUNT] {
        let mut offsets = [0usize; FIELD_COUNT];
        let mut cursor = 0;
        for (offset, &len) in offsets.iter_mut().zip(&self.lengths) {
            *offset = cursor;
            cursor += len as usize;
        }
        offsets
    }
}

/// A record serialized into header and concatenated field bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedConfig {
    pub header: FieldHeader,
    pub payload: Vec<u8>,
}

impl EncodedConfig {
    /// Bytes of one field, by schema index
    pub fn field(&self, index: usize) -> &[u8] {
        let start = self.header.offsets()[index];
        let len = self.header.lengths[index] as usize;
        &self.payload[start..start + len]
    }

    /// Header followed by payload, ready to be written at the configuration base
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Serializes the six configuration fields of a record.
///
/// Fails if the fields do not fit the configuration area; per-field limits
/// are the caller's concern ([`ProvisioningRecord::check`]).
pub fn encode(record: &ProvisioningRecord) -> Result<EncodedConfig, ProvisioningError> {
    let port = record.backend_port.to_le_bytes();
    let fields: [&[u8]; FIELD_COUNT] = [
        record.wifi_ssid.as_bytes(),
        record.wifi_password.as_bytes(),
        record.backend_host.as_bytes(),
        &port,
        record.backend_password.as_bytes(),
        record.update_host.as_bytes(),
    ];

    let required = HEADER_SIZE + fields.iter().map(|f| f.len()).sum::<usize>();
    if required > CONFIG_REGION_SIZE {
        return Err(ProvisioningError::TooLarge {
            required,
            capacity: CONFIG_REGION_SIZE,
        });
    }

    let mut header = FieldHeader::default();
    let mut payload = Vec::with_capacity(required - HEADER_SIZE);
    for (len, field) in header.lengths.iter_mut().zip(fields) {
        // Bounded by CONFIG_REGION_SIZE above, so the cast cannot truncate
        *len = field.len() as u16;
        payload.extend_from_slice(field);
    }

    Ok(EncodedConfig { header, payload })
}

/// Interprets the bytes read for one field.
pub fn decode_field(spec: &FieldSpec, bytes: &[u8]) -> Result<FieldValue, ProvisioningError> {
    match spec.kind {
        FieldKind::Text => core::str::from_utf8(bytes)
            .map(|s| FieldValue::Text(String::from(s)))
            .map_err(|_| ProvisioningError::Encoding { field: spec.name }),
        // An erased region has a zero length here; leave the verdict to validation
        FieldKind::Port if bytes.is_empty() => Ok(FieldValue::Port(0)),
        FieldKind::Port => {
            let raw: [u8; PORT_FIELD_SIZE] =
                bytes
                    .try_into()
                    .map_err(|_| ProvisioningError::StoreCorrupt {
                        field: spec.name,
                        expected: PORT_FIELD_SIZE,
                        actual: bytes.len(),
                    })?;
            Ok(FieldValue::Port(u16::from_le_bytes(raw)))
        }
    }
}

/// Assembles a record from decoded field values in schema order.
///
/// A value whose kind does not match its schema slot, or a value past the
/// last slot, is a [`ProvisioningError::KindMismatch`].
pub fn assemble(
    identity: String,
    values: impl IntoIterator<Item = FieldValue>,
) -> Result<ProvisioningRecord, ProvisioningError> {
    let mut record = ProvisioningRecord {
        identity,
        ..ProvisioningRecord::default()
    };

    for (index, value) in values.into_iter().enumerate() {
        match (index, value) {
            (0, FieldValue::Text(s)) => record.wifi_ssid = s,
            (1, FieldValue::Text(s)) => record.wifi_password = s,
            (2, FieldValue::Text(s)) => record.backend_host = s,
            (3, FieldValue::Port(p)) => record.backend_port = p,
            (4, FieldValue::Text(s)) => record.backend_password = s,
            (5, FieldValue::Text(s)) => record.update_host = s,
            (index, _) => {
                return Err(ProvisioningError::KindMismatch {
                    field: SCHEMA.get(index).map_or("<extra>", |spec| spec.name),
                });
            }
        }
    }

    Ok(record)
}
