//! # Wire protocol — framing, tags, and binary structure encoding
//!
//! ## Responsibility
//! Canonical encoding of calculation requests and responses so any worker
//! understands any client's request, independent of which process built it.
//! Also owns the reserved control tags and the platform-default endpoint
//! paths shared by broker, worker, and client.
//!
//! ## Encoding
//! Payloads are MessagePack maps with named fields, so fields can be added
//! without breaking old readers. Numeric data travels as flat little-endian
//! byte buffers:
//!
//! - `numbers`   — i32 per atom
//! - `positions` — 3 × f64 per atom, row-major
//! - `cell`      — 9 × f64 (3×3 row-major)
//! - `pbc`       — 3 × u8
//! - `forces`    — 3 × f64 per atom; atom count is inferred from
//!   `len / 24` and validated
//! - `stress`    — 6 × f64 (Voigt order)
//!
//! ## Envelopes
//! Every message on the broker's ROUTER sockets is a multipart frame
//! `[peer_identity, empty, tag_or_model, payload...]`; DEALER peers see
//! the same minus the identity frame. Frame-count shortfalls are dropped
//! with a logged warning by the receiving loop, never a crash.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Worker registration / availability control tag.
pub const READY: &[u8] = b"READY";
/// Worker liveness control tag.
pub const HEARTBEAT: &[u8] = b"HEARTBEAT";
/// Client discovery control tag: list currently-known model names.
pub const LIST_MODELS: &[u8] = b"LIST_MODELS";
/// Client discovery control tag: per-model worker counts and registry.
pub const STATUS_DETAIL: &[u8] = b"STATUS_DETAIL";

/// All reserved tags. Model names must never collide with these; the
/// model registry rejects such names at load time.
pub const RESERVED_TAGS: [&[u8]; 4] = [READY, HEARTBEAT, LIST_MODELS, STATUS_DETAIL];

/// Worker-side heartbeat send cadence, in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Broker-side staleness window, in seconds. Exceeds the heartbeat
/// interval by a 3× safety margin to tolerate jitter.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 15;

/// Default worker idle timeout, in seconds. Resets on every received
/// request.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Errors raised while encoding, decoding, or validating wire payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// MessagePack encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// A flat numeric buffer has a length that is not a whole number of
    /// elements (e.g. a forces buffer not divisible by 24 bytes).
    #[error("{field} buffer length {len} is not divisible by {unit}")]
    BufferShape {
        /// Name of the offending field.
        field: &'static str,
        /// Received byte length.
        len: usize,
        /// Required divisor in bytes.
        unit: usize,
    },

    /// A fixed-size buffer has the wrong length (cell, pbc, stress).
    #[error("{field} buffer length {len}, expected {expected} bytes")]
    BufferLength {
        /// Name of the offending field.
        field: &'static str,
        /// Received byte length.
        len: usize,
        /// Required byte length.
        expected: usize,
    },

    /// Atomic numbers and positions disagree on the atom count.
    #[error("structure has {numbers} atomic numbers but {positions} positions")]
    AtomCountMismatch {
        /// Number of atomic numbers decoded.
        numbers: usize,
        /// Number of positions decoded.
        positions: usize,
    },

    /// A successful response is missing a field the caller requested.
    #[error("response missing requested field '{field}'")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },
}

/// An atomic configuration exchanged in calculation requests.
///
/// Immutable value: atomic numbers, Cartesian positions (Å), a 3×3 cell
/// matrix, and per-axis periodic-boundary flags. The atom count is
/// `numbers.len()`, and `positions.len()` always matches it.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    /// Atomic numbers, one per atom.
    pub numbers: Vec<i32>,
    /// Cartesian positions, one `[x, y, z]` per atom.
    pub positions: Vec<[f64; 3]>,
    /// Row-major 3×3 cell matrix.
    pub cell: [[f64; 3]; 3],
    /// Periodic boundary flags per cell vector.
    pub pbc: [bool; 3],
}

impl Structure {
    /// Create a structure, validating that numbers and positions agree
    /// on the atom count.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::AtomCountMismatch`] if the lengths differ.
    pub fn new(
        numbers: Vec<i32>,
        positions: Vec<[f64; 3]>,
        cell: [[f64; 3]; 3],
        pbc: [bool; 3],
    ) -> Result<Self, ProtocolError> {
        if numbers.len() != positions.len() {
            return Err(ProtocolError::AtomCountMismatch {
                numbers: numbers.len(),
                positions: positions.len(),
            });
        }
        Ok(Self {
            numbers,
            positions,
            cell,
            pbc,
        })
    }

    /// Number of atoms.
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// Whether the structure contains no atoms.
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

/// A property a client can request from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Potential energy (eV), a scalar.
    Energy,
    /// Forces (eV/Å), one 3-vector per atom.
    Forces,
    /// Stress (eV/Å³), a Voigt 6-vector.
    Stress,
}

impl Property {
    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Forces => "forces",
            Self::Stress => "stress",
        }
    }

    /// Parse a wire name. Unknown names yield `None` and are skipped by
    /// decoders for forward compatibility.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "energy" => Some(Self::Energy),
            "forces" => Some(Self::Forces),
            "stress" => Some(Self::Stress),
            _ => None,
        }
    }
}

/// Properties assumed when a request names none: energy and forces.
pub const DEFAULT_PROPERTIES: [Property; 2] = [Property::Energy, Property::Forces];

/// Result of one calculation, as carried on the wire.
///
/// On success any requested subset of energy/forces/stress is present;
/// on failure `error` carries the worker's message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalculationResponse {
    /// Whether the calculation succeeded.
    pub success: bool,
    /// Potential energy, if requested and successful.
    pub energy: Option<f64>,
    /// Forces (one 3-vector per atom), if requested and successful.
    pub forces: Option<Vec<[f64; 3]>>,
    /// Voigt stress, if requested and successful.
    pub stress: Option<[f64; 6]>,
    /// Error message, if the calculation failed.
    pub error: Option<String>,
}

impl CalculationResponse {
    /// Build a failure response carrying `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

// Wire forms. These stay private: the public surface deals in
// `Structure`/`CalculationResponse`, decoded and validated.

#[derive(Serialize, Deserialize)]
struct RawRequest {
    #[serde(with = "serde_bytes")]
    numbers: Vec<u8>,
    #[serde(with = "serde_bytes")]
    positions: Vec<u8>,
    #[serde(with = "serde_bytes")]
    cell: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pbc: Vec<u8>,
    #[serde(default)]
    properties: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    energy: Option<f64>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    forces: Option<Vec<u8>>,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    stress: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RawModelList {
    models: Vec<String>,
}

/// Reply payload for `STATUS_DETAIL`: per-model worker counts plus the
/// autostart registry, tagged with whether autostart is available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetail {
    /// Registered worker count per model name.
    pub models: BTreeMap<String, usize>,
    /// Model names the autostart registry can spawn (empty on a base
    /// broker).
    pub registry: Vec<String>,
    /// Whether the answering broker is autostart-capable.
    pub autostart: bool,
}

/// Encode a calculation request for `structure` and `properties`.
///
/// # Errors
///
/// [`ProtocolError::Encode`] on serialization failure.
pub fn pack_request(
    structure: &Structure,
    properties: &[Property],
) -> Result<Vec<u8>, ProtocolError> {
    let raw = RawRequest {
        numbers: i32s_to_bytes(structure.numbers.iter().copied()),
        positions: f64s_to_bytes(structure.positions.iter().flatten().copied()),
        cell: f64s_to_bytes(structure.cell.iter().flatten().copied()),
        pbc: structure.pbc.iter().map(|&b| b as u8).collect(),
        properties: properties.iter().map(|p| p.as_str().to_string()).collect(),
    };
    Ok(rmp_serde::to_vec_named(&raw)?)
}

/// Decode a calculation request into a [`Structure`] and the requested
/// properties.
///
/// Unknown property names are ignored; an empty property list decodes to
/// [`DEFAULT_PROPERTIES`].
///
/// # Errors
///
/// Decode errors, buffer-shape violations, or an atom-count mismatch.
pub fn unpack_request(data: &[u8]) -> Result<(Structure, Vec<Property>), ProtocolError> {
    let raw: RawRequest = rmp_serde::from_slice(data)?;

    let numbers = bytes_to_i32s("numbers", &raw.numbers)?;
    let positions = bytes_to_triplets("positions", &raw.positions)?;
    if numbers.len() != positions.len() {
        return Err(ProtocolError::AtomCountMismatch {
            numbers: numbers.len(),
            positions: positions.len(),
        });
    }

    if raw.cell.len() != 72 {
        return Err(ProtocolError::BufferLength {
            field: "cell",
            len: raw.cell.len(),
            expected: 72,
        });
    }
    let flat = bytes_to_f64s("cell", &raw.cell)?;
    let mut cell = [[0.0; 3]; 3];
    for (i, row) in cell.iter_mut().enumerate() {
        row.copy_from_slice(&flat[i * 3..i * 3 + 3]);
    }

    if raw.pbc.len() != 3 {
        return Err(ProtocolError::BufferLength {
            field: "pbc",
            len: raw.pbc.len(),
            expected: 3,
        });
    }
    let pbc = [raw.pbc[0] != 0, raw.pbc[1] != 0, raw.pbc[2] != 0];

    let properties: Vec<Property> = if raw.properties.is_empty() {
        DEFAULT_PROPERTIES.to_vec()
    } else {
        raw.properties
            .iter()
            .filter_map(|name| Property::parse(name))
            .collect()
    };

    Ok((
        Structure {
            numbers,
            positions,
            cell,
            pbc,
        },
        properties,
    ))
}

/// Encode a successful calculation response.
///
/// # Errors
///
/// [`ProtocolError::Encode`] on serialization failure.
pub fn pack_success(
    energy: Option<f64>,
    forces: Option<&[[f64; 3]]>,
    stress: Option<&[f64; 6]>,
) -> Result<Vec<u8>, ProtocolError> {
    let raw = RawResponse {
        success: true,
        energy,
        forces: forces.map(|f| f64s_to_bytes(f.iter().flatten().copied())),
        stress: stress.map(|s| f64s_to_bytes(s.iter().copied())),
        error: None,
    };
    Ok(rmp_serde::to_vec_named(&raw)?)
}

/// Encode a failure response carrying `message`.
///
/// # Errors
///
/// [`ProtocolError::Encode`] on serialization failure.
pub fn pack_failure(message: &str) -> Result<Vec<u8>, ProtocolError> {
    let raw = RawResponse {
        success: false,
        energy: None,
        forces: None,
        stress: None,
        error: Some(message.to_string()),
    };
    Ok(rmp_serde::to_vec_named(&raw)?)
}

/// Decode a calculation response, reconstructing the forces shape from
/// the buffer length (`len / 24` atoms).
///
/// # Errors
///
/// Decode errors or buffer-shape violations.
pub fn unpack_response(data: &[u8]) -> Result<CalculationResponse, ProtocolError> {
    let raw: RawResponse = rmp_serde::from_slice(data)?;

    let forces = match raw.forces {
        Some(bytes) => Some(bytes_to_triplets("forces", &bytes)?),
        None => None,
    };
    let stress = match raw.stress {
        Some(bytes) => {
            if bytes.len() != 48 {
                return Err(ProtocolError::BufferLength {
                    field: "stress",
                    len: bytes.len(),
                    expected: 48,
                });
            }
            let flat = bytes_to_f64s("stress", &bytes)?;
            let mut s = [0.0; 6];
            s.copy_from_slice(&flat);
            Some(s)
        }
        None => None,
    };

    Ok(CalculationResponse {
        success: raw.success,
        energy: raw.energy,
        forces,
        stress,
        error: raw.error,
    })
}

/// Encode a `LIST_MODELS` reply.
///
/// # Errors
///
/// [`ProtocolError::Encode`] on serialization failure.
pub fn pack_model_list(models: &[String]) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(&RawModelList {
        models: models.to_vec(),
    })?)
}

/// Decode a `LIST_MODELS` reply.
///
/// # Errors
///
/// [`ProtocolError::Decode`] on malformed input.
pub fn unpack_model_list(data: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let raw: RawModelList = rmp_serde::from_slice(data)?;
    Ok(raw.models)
}

/// Encode a `STATUS_DETAIL` reply.
///
/// # Errors
///
/// [`ProtocolError::Encode`] on serialization failure.
pub fn pack_status_detail(detail: &StatusDetail) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec_named(detail)?)
}

/// Decode a `STATUS_DETAIL` reply.
///
/// # Errors
///
/// [`ProtocolError::Decode`] on malformed input.
pub fn unpack_status_detail(data: &[u8]) -> Result<StatusDetail, ProtocolError> {
    Ok(rmp_serde::from_slice(data)?)
}

// ── Endpoint paths ────────────────────────────────────────────────────────

/// Default client-facing (frontend) broker endpoint.
///
/// Derived from `XDG_RUNTIME_DIR` when set, falling back to the system
/// temporary directory: `ipc://<runtime dir>/mlip-serve/broker.ipc`.
pub fn default_frontend_endpoint() -> String {
    format!("ipc://{}", runtime_dir().join("broker.ipc").display())
}

/// Default worker-facing (backend) broker endpoint.
pub fn default_backend_endpoint() -> String {
    format!("ipc://{}", runtime_dir().join("workers.ipc").display())
}

fn runtime_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    base.join("mlip-serve")
}

/// Extract the filesystem path backing an `ipc://` endpoint, if any.
pub fn socket_file(endpoint: &str) -> Option<PathBuf> {
    endpoint.strip_prefix("ipc://").map(PathBuf::from)
}

/// Whether the socket file behind an `ipc://` endpoint currently exists.
///
/// Non-`ipc` endpoints always report `false`.
pub fn broker_socket_exists(endpoint: &str) -> bool {
    socket_file(endpoint).is_some_and(|p| p.exists())
}

/// Create the parent directory of an `ipc://` endpoint's socket file.
///
/// # Errors
///
/// Propagates filesystem errors from directory creation.
pub fn ensure_endpoint_dir(endpoint: &str) -> std::io::Result<()> {
    if let Some(path) = socket_file(endpoint) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ── Flat buffer helpers ───────────────────────────────────────────────────

fn f64s_to_bytes(values: impl Iterator<Item = f64>) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn i32s_to_bytes(values: impl Iterator<Item = i32>) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn bytes_to_f64s(field: &'static str, bytes: &[u8]) -> Result<Vec<f64>, ProtocolError> {
    if bytes.len() % 8 != 0 {
        return Err(ProtocolError::BufferShape {
            field,
            len: bytes.len(),
            unit: 8,
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            f64::from_le_bytes(buf)
        })
        .collect())
}

fn bytes_to_i32s(field: &'static str, bytes: &[u8]) -> Result<Vec<i32>, ProtocolError> {
    if bytes.len() % 4 != 0 {
        return Err(ProtocolError::BufferShape {
            field,
            len: bytes.len(),
            unit: 4,
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(c);
            i32::from_le_bytes(buf)
        })
        .collect())
}

/// Decode a flat f64 buffer into 3-vectors. The element count is
/// inferred from `len / 24`; a remainder is a decode error.
fn bytes_to_triplets(
    field: &'static str,
    bytes: &[u8],
) -> Result<Vec<[f64; 3]>, ProtocolError> {
    if bytes.len() % 24 != 0 {
        return Err(ProtocolError::BufferShape {
            field,
            len: bytes.len(),
            unit: 24,
        });
    }
    let flat = bytes_to_f64s(field, bytes)?;
    Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_structure(n: usize) -> Structure {
        let numbers: Vec<i32> = (0..n).map(|i| (i % 90) as i32 + 1).collect();
        let positions: Vec<[f64; 3]> = (0..n)
            .map(|i| {
                let x = i as f64;
                [
                    x * std::f64::consts::PI,
                    -x / 7.0 + 1e-17,
                    (x + 1.0).ln() * 1e8,
                ]
            })
            .collect();
        let cell = [
            [10.0, 0.0, 0.0],
            [0.1, 9.5, 0.0],
            [-0.2, 0.3, 11.25],
        ];
        Structure {
            numbers,
            positions,
            cell,
            pbc: [true, true, false],
        }
    }

    #[test]
    fn test_request_round_trip_bit_exact() {
        for n in [1usize, 2, 100] {
            let structure = sample_structure(n);
            let packed =
                pack_request(&structure, &[Property::Energy, Property::Stress]).ok().unwrap();
            let (decoded, properties) = unpack_request(&packed).ok().unwrap();
            assert_eq!(decoded, structure, "round trip altered structure for n={n}");
            assert_eq!(properties, vec![Property::Energy, Property::Stress]);
        }
    }

    #[test]
    fn test_request_round_trip_preserves_exotic_floats() {
        let structure = Structure {
            numbers: vec![1, 8],
            positions: vec![[f64::MIN_POSITIVE, -0.0, f64::MAX], [1e-300, 2.5e300, 0.0]],
            cell: [[0.0; 3]; 3],
            pbc: [false, false, false],
        };
        let packed = pack_request(&structure, &[Property::Forces]).ok().unwrap();
        let (decoded, _) = unpack_request(&packed).ok().unwrap();
        assert_eq!(decoded.positions[0][0].to_bits(), f64::MIN_POSITIVE.to_bits());
        assert_eq!(decoded.positions[0][1].to_bits(), (-0.0f64).to_bits());
        assert_eq!(decoded.positions[0][2].to_bits(), f64::MAX.to_bits());
    }

    #[test]
    fn test_empty_properties_decode_to_defaults() {
        let structure = sample_structure(1);
        let packed = pack_request(&structure, &[]).ok().unwrap();
        let (_, properties) = unpack_request(&packed).ok().unwrap();
        assert_eq!(properties, DEFAULT_PROPERTIES.to_vec());
    }

    #[test]
    fn test_unknown_property_names_are_ignored() {
        // Hand-build a request with a property name this version does not know.
        let raw = RawRequest {
            numbers: i32s_to_bytes([1].into_iter()),
            positions: f64s_to_bytes([0.0, 0.0, 0.0].into_iter()),
            cell: f64s_to_bytes([0.0; 9].into_iter()),
            pbc: vec![0, 0, 0],
            properties: vec!["energy".to_string(), "dipole".to_string()],
        };
        let packed = rmp_serde::to_vec_named(&raw).ok().unwrap();
        let (_, properties) = unpack_request(&packed).ok().unwrap();
        assert_eq!(properties, vec![Property::Energy]);
    }

    #[test]
    fn test_structure_new_rejects_count_mismatch() {
        let result = Structure::new(
            vec![1, 2],
            vec![[0.0; 3]],
            [[0.0; 3]; 3],
            [false; 3],
        );
        assert!(matches!(
            result,
            Err(ProtocolError::AtomCountMismatch {
                numbers: 2,
                positions: 1
            })
        ));
    }

    #[test]
    fn test_unpack_request_rejects_truncated_positions() {
        let raw = RawRequest {
            numbers: i32s_to_bytes([1].into_iter()),
            positions: vec![0u8; 23], // one byte short of a 3-vector
            cell: f64s_to_bytes([0.0; 9].into_iter()),
            pbc: vec![0, 0, 0],
            properties: vec![],
        };
        let packed = rmp_serde::to_vec_named(&raw).ok().unwrap();
        assert!(matches!(
            unpack_request(&packed),
            Err(ProtocolError::BufferShape { field: "positions", .. })
        ));
    }

    #[test]
    fn test_unpack_request_rejects_bad_cell_length() {
        let raw = RawRequest {
            numbers: i32s_to_bytes([1].into_iter()),
            positions: f64s_to_bytes([0.0; 3].into_iter()),
            cell: f64s_to_bytes([0.0; 8].into_iter()),
            pbc: vec![0, 0, 0],
            properties: vec![],
        };
        let packed = rmp_serde::to_vec_named(&raw).ok().unwrap();
        assert!(matches!(
            unpack_request(&packed),
            Err(ProtocolError::BufferLength { field: "cell", expected: 72, .. })
        ));
    }

    #[test]
    fn test_response_round_trip_success() {
        let forces = vec![[1.0, -2.0, 3.5], [0.0, 1e-12, -7.25]];
        let stress = [1.0, 2.0, 3.0, -0.5, 0.25, 0.125];
        let packed = pack_success(Some(-13.6), Some(&forces), Some(&stress)).ok().unwrap();
        let response = unpack_response(&packed).ok().unwrap();
        assert!(response.success);
        assert_eq!(response.energy, Some(-13.6));
        assert_eq!(response.forces, Some(forces));
        assert_eq!(response.stress, Some(stress));
        assert_eq!(response.error, None);
    }

    #[test]
    fn test_response_round_trip_partial_fields() {
        let packed = pack_success(Some(1.25), None, None).ok().unwrap();
        let response = unpack_response(&packed).ok().unwrap();
        assert!(response.success);
        assert_eq!(response.energy, Some(1.25));
        assert!(response.forces.is_none());
        assert!(response.stress.is_none());
    }

    #[test]
    fn test_response_round_trip_failure() {
        let packed = pack_failure("no workers available for model 'mace'").ok().unwrap();
        let response = unpack_response(&packed).ok().unwrap();
        assert!(!response.success);
        assert_eq!(
            response.error.as_deref(),
            Some("no workers available for model 'mace'")
        );
    }

    #[test]
    fn test_unpack_response_rejects_ragged_forces() {
        let raw = RawResponse {
            success: true,
            energy: None,
            forces: Some(vec![0u8; 25]),
            stress: None,
            error: None,
        };
        let packed = rmp_serde::to_vec_named(&raw).ok().unwrap();
        assert!(matches!(
            unpack_response(&packed),
            Err(ProtocolError::BufferShape { field: "forces", unit: 24, .. })
        ));
    }

    #[test]
    fn test_unpack_response_rejects_short_stress() {
        let raw = RawResponse {
            success: true,
            energy: None,
            forces: None,
            stress: Some(vec![0u8; 40]),
            error: None,
        };
        let packed = rmp_serde::to_vec_named(&raw).ok().unwrap();
        assert!(matches!(
            unpack_response(&packed),
            Err(ProtocolError::BufferLength { field: "stress", expected: 48, .. })
        ));
    }

    #[test]
    fn test_forces_atom_count_inferred_from_buffer_length() {
        let forces: Vec<[f64; 3]> = (0..7).map(|i| [i as f64, 0.0, -(i as f64)]).collect();
        let packed = pack_success(None, Some(&forces), None).ok().unwrap();
        let response = unpack_response(&packed).ok().unwrap();
        assert_eq!(response.forces.map(|f| f.len()), Some(7));
    }

    #[test]
    fn test_model_list_round_trip() {
        let models = vec!["lj".to_string(), "mace-mpa-0".to_string()];
        let packed = pack_model_list(&models).ok().unwrap();
        assert_eq!(unpack_model_list(&packed).ok().unwrap(), models);
    }

    #[test]
    fn test_status_detail_round_trip() {
        let mut counts = BTreeMap::new();
        counts.insert("lj".to_string(), 2usize);
        let detail = StatusDetail {
            models: counts,
            registry: vec!["lj".to_string(), "constant".to_string()],
            autostart: true,
        };
        let packed = pack_status_detail(&detail).ok().unwrap();
        assert_eq!(unpack_status_detail(&packed).ok().unwrap(), detail);
    }

    #[test]
    fn test_reserved_tags_are_distinct() {
        for (i, a) in RESERVED_TAGS.iter().enumerate() {
            for b in RESERVED_TAGS.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_socket_file_strips_scheme() {
        assert_eq!(
            socket_file("ipc:///tmp/mlip-serve/broker.ipc"),
            Some(PathBuf::from("/tmp/mlip-serve/broker.ipc"))
        );
        assert_eq!(socket_file("tcp://127.0.0.1:5555"), None);
    }

    #[test]
    fn test_default_endpoints_differ() {
        assert_ne!(default_frontend_endpoint(), default_backend_endpoint());
        assert!(default_frontend_endpoint().starts_with("ipc://"));
    }

    #[test]
    fn test_broker_socket_exists_for_real_file() {
        let dir = tempfile::tempdir().ok().unwrap();
        let path = dir.path().join("broker.ipc");
        std::fs::write(&path, b"").ok().unwrap();
        let endpoint = format!("ipc://{}", path.display());
        assert!(broker_socket_exists(&endpoint));
        assert!(!broker_socket_exists("ipc:///definitely/not/here.ipc"));
    }
}
