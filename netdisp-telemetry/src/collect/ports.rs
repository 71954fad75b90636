//! Switch port table fed by line-oriented link/traffic records.
//!
//! Records arrive as `port <N>, link <0|1>, speed <Mbps>, tx <bytes>, rx <bytes>`.
//! Ingesting a record only writes the port's pending state; the visible state
//! moves in [`PortTable::reconcile`], which reports what changed so a renderer
//! can refresh once per cycle no matter how many records were drained.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of physical ports on the board, management port included.
pub const NR_PORTS: usize = 5;

/// Logical index of the management port.
pub const MANAGEMENT_PORT: usize = 0;

/// Negotiated speed that gets the reduced throughput ceiling.
pub const GIGABIT_MBPS: u32 = 1000;

/// Throughput a gigabit link actually reaches on this board.
pub const GIGABIT_EFFECTIVE_MBPS: u64 = 300;

const FIELD_LABELS: [&str; 5] = ["port", "link", "speed", "tx", "rx"];

/// Per-line ingest failures. The line is dropped and the table is untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed port record: {0}")]
    Malformed(String),

    #[error("wire port {wire} has no logical port")]
    PortOutOfRange { wire: u64 },
}

/// Link state of a port as shown on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// Administratively disabled, or not wired out by the pinmux.
    Unused,
    /// Link down.
    Inactive,
    /// Link up.
    Active,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "unused"),
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Mapping from the feed's port numbers to logical port indices.
///
/// Both variants are bijections over `0..NR_PORTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRemap {
    /// `logical = (NR_PORTS - wire) % NR_PORTS`: wire 0 stays the management
    /// port, wire 1..=4 land on 4..=1.
    #[default]
    Reverse,
    /// Earlier feed revision: `logical = (wire + 1) % NR_PORTS`.
    Rotate,
}

impl PortRemap {
    pub fn to_logical(self, wire: u64) -> Option<usize> {
        let wire = usize::try_from(wire).ok().filter(|w| *w < NR_PORTS)?;
        Some(match self {
            Self::Reverse => (NR_PORTS - wire) % NR_PORTS,
            Self::Rotate => (wire + 1) % NR_PORTS,
        })
    }

    pub fn to_wire(self, logical: usize) -> Option<u64> {
        if logical >= NR_PORTS {
            return None;
        }
        let wire = match self {
            Self::Reverse => (NR_PORTS - logical) % NR_PORTS,
            Self::Rotate => (logical + NR_PORTS - 1) % NR_PORTS,
        };
        u64::try_from(wire).ok()
    }
}

impl FromStr for PortRemap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reverse" => Ok(Self::Reverse),
            "rotate" => Ok(Self::Rotate),
            other => Err(format!("unknown port remap '{other}' (expected reverse or rotate)")),
        }
    }
}

/// One parsed feed record, still in wire numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRecord {
    pub wire_port: u64,
    pub link_up: bool,
    pub speed_mbps: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl FromStr for PortRecord {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() != FIELD_LABELS.len() {
            return Err(ParseError::Malformed(format!(
                "expected {} fields, got {}",
                FIELD_LABELS.len(),
                fields.len()
            )));
        }

        let mut values = [0u64; 5];
        for ((slot, label), field) in values.iter_mut().zip(FIELD_LABELS).zip(fields) {
            *slot = field_value(label, field)?;
        }
        let [wire_port, link, speed, tx_bytes, rx_bytes] = values;

        let link_up = match link {
            0 => false,
            1 => true,
            other => {
                return Err(ParseError::Malformed(format!(
                    "link flag must be 0 or 1, got {other}"
                )));
            }
        };
        let speed_mbps = u32::try_from(speed)
            .map_err(|_| ParseError::Malformed(format!("speed {speed} out of range")))?;

        Ok(Self {
            wire_port,
            link_up,
            speed_mbps,
            tx_bytes,
            rx_bytes,
        })
    }
}

fn field_value(label: &str, field: &str) -> Result<u64, ParseError> {
    let mut parts = field.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(found), Some(raw), None) if found == label => raw
            .parse()
            .map_err(|_| ParseError::Malformed(format!("{label}: invalid number '{raw}'"))),
        _ => Err(ParseError::Malformed(format!(
            "expected '{label} <n>', got '{}'",
            field.trim()
        ))),
    }
}

/// Bytes per second that count as 100% for a negotiated speed.
pub fn max_bytes_per_second(speed_mbps: u32) -> u64 {
    let effective = if speed_mbps == GIGABIT_MBPS {
        GIGABIT_EFFECTIVE_MBPS
    } else {
        u64::from(speed_mbps)
    };
    effective * 1_000_000 / 8
}

/// Unclamped utilization of a link carrying `tx + rx` bytes per second.
///
/// A link-up record advertising speed 0 has no ceiling and reports 0.
pub fn utilization_percent(speed_mbps: u32, tx_bytes: u64, rx_bytes: u64) -> u64 {
    let ceiling = max_bytes_per_second(speed_mbps);
    if ceiling == 0 {
        return 0;
    }
    let load = u128::from(tx_bytes) + u128::from(rx_bytes);
    u64::try_from(100 * load / u128::from(ceiling)).unwrap_or(u64::MAX)
}

/// One row of the port table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Port {
    pub index: usize,
    pub state: PortState,
    pub pending_state: PortState,
    /// Last negotiated speed; only meaningful while `state` is Active.
    pub speed_mbps: u32,
    pub utilization_percent: u64,
}

impl Port {
    fn new(index: usize, state: PortState, speed_mbps: u32) -> Self {
        Self {
            index,
            state,
            pending_state: state,
            speed_mbps,
            utilization_percent: 0,
        }
    }
}

/// Result of applying one record to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortUpdate {
    pub port: usize,
    pub link_up: bool,
    pub speed_mbps: u32,
    pub utilization_percent: u64,
}

/// A committed state change reported by [`PortTable::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortTransition {
    pub port: usize,
    pub old_state: PortState,
    pub new_state: PortState,
    /// Present only when the new state is Active.
    pub speed_mbps: Option<u32>,
    pub label: String,
}

/// Utilization of a port whose committed state is Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortUtilization {
    pub port: usize,
    pub speed_mbps: u32,
    pub percent: u64,
}

/// Label text for a port in `state` at `speed_mbps`.
pub fn port_label(state: PortState, speed_mbps: u32) -> String {
    match state {
        PortState::Active => format!("{speed_mbps} Mbps"),
        PortState::Inactive => "No link".to_string(),
        PortState::Unused => "Disabled".to_string(),
    }
}

/// Fixed-size table of the board's ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTable {
    ports: [Port; NR_PORTS],
    remap: PortRemap,
}

impl PortTable {
    /// Management port up at 1 Gbps, every switch port link-down.
    pub fn new(remap: PortRemap) -> Self {
        let ports = std::array::from_fn(|index| {
            if index == MANAGEMENT_PORT {
                Port::new(index, PortState::Active, GIGABIT_MBPS)
            } else {
                Port::new(index, PortState::Inactive, 0)
            }
        });
        Self { ports, remap }
    }

    /// Start the listed switch ports as Unused, for ports the pinmux leaves
    /// unconnected. The management port and out-of-range indices are skipped.
    pub fn with_unused_ports(mut self, unused: &[usize]) -> Self {
        for &index in unused {
            if index == MANAGEMENT_PORT || index >= NR_PORTS {
                warn!(port = index, "Ignoring unusable port in unused list");
                continue;
            }
            let port = &mut self.ports[index];
            port.state = PortState::Unused;
            port.pending_state = PortState::Unused;
        }
        self
    }

    pub fn remap(&self) -> PortRemap {
        self.remap
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, index: usize) -> Option<&Port> {
        self.ports.get(index)
    }

    /// Parse one record and stage it on its port.
    pub fn ingest(&mut self, line: &str) -> Result<PortUpdate, ParseError> {
        let record: PortRecord = line.parse()?;
        let index = self
            .remap
            .to_logical(record.wire_port)
            .ok_or(ParseError::PortOutOfRange {
                wire: record.wire_port,
            })?;
        Ok(self.apply(index, &record))
    }

    fn apply(&mut self, index: usize, record: &PortRecord) -> PortUpdate {
        let port = &mut self.ports[index];

        if record.link_up {
            port.pending_state = PortState::Active;
            port.speed_mbps = record.speed_mbps;
            port.utilization_percent =
                utilization_percent(record.speed_mbps, record.tx_bytes, record.rx_bytes);
        } else {
            port.pending_state = PortState::Inactive;
            port.utilization_percent = 0;
        }

        debug!(
            port = index,
            wire = record.wire_port,
            link_up = record.link_up,
            speed_mbps = record.speed_mbps,
            utilization = port.utilization_percent,
            "Port record staged"
        );

        PortUpdate {
            port: index,
            link_up: record.link_up,
            speed_mbps: port.speed_mbps,
            utilization_percent: port.utilization_percent,
        }
    }

    /// Flip a switch port between Unused and Inactive.
    ///
    /// The management port and out-of-range indices are ignored. Toggling
    /// never raises a link; only the feed can make a port Active.
    pub fn toggle(&mut self, index: usize) {
        if index == MANAGEMENT_PORT || index >= NR_PORTS {
            debug!(port = index, "Toggle ignored");
            return;
        }
        let port = &mut self.ports[index];
        port.pending_state = match port.pending_state {
            PortState::Unused => PortState::Inactive,
            PortState::Inactive | PortState::Active => PortState::Unused,
        };
        debug!(port = index, pending = %port.pending_state, "Port toggled");
    }

    /// Commit pending states and report every port that changed.
    pub fn reconcile(&mut self) -> Vec<PortTransition> {
        let mut transitions = Vec::new();

        for port in self.ports.iter_mut() {
            if port.pending_state == port.state {
                continue;
            }
            let old_state = port.state;
            port.state = port.pending_state;

            let speed_mbps = (port.state == PortState::Active).then_some(port.speed_mbps);
            let transition = PortTransition {
                port: port.index,
                old_state,
                new_state: port.state,
                speed_mbps,
                label: port_label(port.state, port.speed_mbps),
            };
            info!(
                port = transition.port,
                from = %old_state,
                to = %transition.new_state,
                label = %transition.label,
                "Port state changed"
            );
            transitions.push(transition);
        }

        transitions
    }

    /// Utilization of every port currently shown as Active.
    pub fn utilization(&self) -> Vec<PortUtilization> {
        self.ports
            .iter()
            .filter(|port| port.state == PortState::Active)
            .map(|port| PortUtilization {
                port: port.index,
                speed_mbps: port.speed_mbps,
                percent: port.utilization_percent,
            })
            .collect()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new(PortRemap::default())
    }
}
