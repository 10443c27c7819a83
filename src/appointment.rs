//! Appointment workflow
//!
//! A three-phase booking wizard with an import and an export variant. The
//! workflow is resumable: every attempt runs against a sub-session that
//! accumulates field values, survives failures for a TTL, and continues
//! from the phase it stopped at.

mod runner;


pub use runner::{AppointmentOutcome, WizardRunner};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Sentinel plate meaning "pick the first available autocomplete option".
pub const WILDCARD_PLATE: &str = "ABC123";

pub const DEFAULT_PIN: &str = "1111";
const DEFAULT_QUANTITY: &str = "1";
const DEFAULT_UNIT_NUMBER: &str = "1";
const DEFAULT_SEAL: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Import,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    One,
    Two,
    Three,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        match self {
            Phase::One => 1,
            Phase::Two => 2,
            Phase::Three => 3,
        }
    }

    pub fn next(self) -> Phase {
        match self {
            Phase::One => Phase::Two,
            Phase::Two | Phase::Three => Phase::Three,
        }
    }
}

/// Accumulated field values across phases. Everything optional: the
/// contract check (`missing_for`) decides what a phase actually needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseData {
    pub trucking_company: Option<String>,
    pub terminal: Option<String>,
    pub move_type: Option<String>,
    pub container_id: Option<String>,
    pub booking_number: Option<String>,
    pub quantity: Option<String>,
    pub pin_code: Option<String>,
    pub unit_number: Option<String>,
    pub seal_number: Option<String>,
    pub truck_plate: Option<String>,
    pub own_chassis: Option<bool>,
    pub appointment_time: Option<String>,
}

impl PhaseData {
    /// Later-supplied fields override earlier ones; absent fields never
    /// clobber accumulated values.
    pub fn merge(&mut self, incoming: PhaseData) {
        macro_rules! take {
            ($field:ident) => {
                if incoming.$field.is_some() {
                    self.$field = incoming.$field;
                }
            };
        }
        take!(trucking_company);
        take!(terminal);
        take!(move_type);
        take!(container_id);
        take!(booking_number);
        take!(quantity);
        take!(pin_code);
        take!(unit_number);
        take!(seal_number);
        take!(truck_plate);
        take!(own_chassis);
        take!(appointment_time);
    }

    /// Apply the documented defaults. An empty or null PIN becomes "1111";
    /// export quantity, unit number, and seals default to "1".
    pub fn normalize(&mut self, container_type: ContainerType) {
        if self.pin_code.as_deref().map_or(true, str::is_empty) {
            self.pin_code = Some(DEFAULT_PIN.to_string());
        }
        if container_type == ContainerType::Export {
            if self.quantity.as_deref().map_or(true, str::is_empty) {
                self.quantity = Some(DEFAULT_QUANTITY.to_string());
            }
            if self.unit_number.as_deref().map_or(true, str::is_empty) {
                self.unit_number = Some(DEFAULT_UNIT_NUMBER.to_string());
            }
            if self.seal_number.as_deref().map_or(true, str::is_empty) {
                self.seal_number = Some(DEFAULT_SEAL.to_string());
            }
        }
    }

    /// First field the given phase still needs, if any.
    pub fn missing_for(
        &self,
        phase: Phase,
        container_type: ContainerType,
    ) -> Option<&'static str> {
        let missing_str = |value: &Option<String>, name: &'static str| {
            value.as_deref().map_or(true, str::is_empty).then_some(name)
        };
        match phase {
            Phase::One => missing_str(&self.trucking_company, "trucking_company")
                .or_else(|| missing_str(&self.terminal, "terminal"))
                .or_else(|| missing_str(&self.move_type, "move_type"))
                .or_else(|| match container_type {
                    ContainerType::Import => missing_str(&self.container_id, "container_id"),
                    ContainerType::Export => {
                        missing_str(&self.booking_number, "booking_number")
                    }
                }),
            Phase::Two => {
                // An empty plate is the wildcard, so only None is missing.
                if self.truck_plate.is_none() {
                    Some("truck_plate")
                } else if self.own_chassis.is_none() {
                    Some("own_chassis")
                } else {
                    None
                }
            }
            Phase::Three => None,
        }
    }

    /// Whether the plate value means "first available from autocomplete".
    pub fn plate_is_wildcard(&self) -> bool {
        matches!(
            self.truck_plate.as_deref(),
            Some("") | Some(WILDCARD_PLATE)
        )
    }
}

/// Resumable workflow state, keyed by `appt_id`, tied to one browser
/// session. Expires after a TTL of inactivity.
#[derive(Debug, Clone)]
pub struct SubSession {
    pub appt_id: String,
    pub browser_session_id: String,
    pub container_type: ContainerType,
    pub phase: Phase,
    pub data: PhaseData,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

pub struct SubSessionStore {
    inner: Mutex<HashMap<String, SubSession>>,
    ttl: Duration,
}

impl SubSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn create(
        &self,
        browser_session_id: &str,
        container_type: ContainerType,
        data: PhaseData,
    ) -> SubSession {
        let now = Utc::now();
        let sub = SubSession {
            appt_id: uuid::Uuid::new_v4().to_string(),
            browser_session_id: browser_session_id.to_string(),
            container_type,
            phase: Phase::One,
            data,
            created_at: now,
            last_used_at: now,
        };
        self.inner
            .lock()
            .unwrap()
            .insert(sub.appt_id.clone(), sub.clone());
        sub
    }

    /// Fetch for resumption, bumping `last_used_at`. Expired entries are
    /// purged on the way.
    pub fn resume(&self, appt_id: &str) -> Option<SubSession> {
        let mut map = self.inner.lock().unwrap();
        let now = Utc::now();
        map.retain(|_, sub| {
            (now - sub.last_used_at).to_std().unwrap_or_default() < self.ttl
        });
        let sub = map.get_mut(appt_id)?;
        sub.last_used_at = now;
        Some(sub.clone())
    }

    /// Persist the latest state after an attempt.
    pub fn put(&self, mut sub: SubSession) {
        sub.last_used_at = Utc::now();
        self.inner.lock().unwrap().insert(sub.appt_id.clone(), sub);
    }

    pub fn remove(&self, appt_id: &str) {
        self.inner.lock().unwrap().remove(appt_id);
    }

    /// Drop every sub-session riding on a closed browser session.
    pub fn discard_for_browser_session(&self, browser_session_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .retain(|_, sub| sub.browser_session_id != browser_session_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
