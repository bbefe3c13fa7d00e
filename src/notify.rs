//! Transient alerts for inbound messages.
//!
//! Alerts are raised for every inbound envelope, whatever conversation is
//! focused. Their lifecycle is computed from a caller-supplied clock so the
//! UI loop decides when to redraw.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::api::models::InboundEnvelope;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub from: String,
    pub text: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Visible,
    Fading,
    Removed,
}

struct Active {
    notification: Notification,
    raised_at: Instant,
}

pub struct NotificationDispatcher {
    visible_for: Duration,
    fade_for: Duration,
    active: Vec<Active>,
    next_id: u64,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_millis(300))
    }
}

impl NotificationDispatcher {
    pub fn new(visible_for: Duration, fade_for: Duration) -> Self {
        Self {
            visible_for,
            fade_for,
            active: Vec::new(),
            next_id: 1,
        }
    }

    /// Raises an alert for `envelope`. Alerts already past their fade at
    /// `now` are dropped first.
    pub fn on_inbound(&mut self, envelope: &InboundEnvelope, display_name: &str, now: Instant) -> Notification {
        self.sweep(now);
        let display_name = if display_name.trim().is_empty() {
            envelope.from.clone()
        } else {
            display_name.to_string()
        };
        let notification = Notification {
            id: self.next_id,
            from: envelope.from.clone(),
            text: envelope.text.clone(),
            display_name,
        };
        self.next_id += 1;
        debug!("Raised notification {} from {}", notification.id, notification.from);
        self.active.push(Active {
            notification: notification.clone(),
            raised_at: now,
        });
        notification
    }

    pub fn phase_of(&self, id: u64, now: Instant) -> Phase {
        self.active
            .iter()
            .find(|a| a.notification.id == id)
            .map(|a| self.phase(a, now))
            .unwrap_or(Phase::Removed)
    }

    /// Alerts still on screen at `now`, oldest first, with their phase.
    pub fn active(&self, now: Instant) -> Vec<(&Notification, Phase)> {
        self.active
            .iter()
            .map(|a| (&a.notification, self.phase(a, now)))
            .filter(|(_, phase)| *phase != Phase::Removed)
            .collect()
    }

    /// Drops expired alerts. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let lifetime = self.visible_for + self.fade_for;
        let before = self.active.len();
        self.active.retain(|a| now.saturating_duration_since(a.raised_at) < lifetime);
        before - self.active.len()
    }

    /// The next instant at which some alert changes phase.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active
            .iter()
            .flat_map(|a| {
                let fade_at = a.raised_at + self.visible_for;
                [fade_at, fade_at + self.fade_for]
            })
            .filter(|deadline| *deadline > Instant::now())
            .min()
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.active.len();
        self.active.retain(|a| a.notification.id != id);
        before != self.active.len()
    }

    /// Removes the alert and returns the peer whose conversation should be
    /// opened.
    pub fn click(&mut self, id: u64) -> Option<String> {
        let index = self.active.iter().position(|a| a.notification.id == id)?;
        Some(self.active.remove(index).notification.from)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn phase(&self, active: &Active, now: Instant) -> Phase {
        let age = now.saturating_duration_since(active.raised_at);
        if age < self.visible_for {
            Phase::Visible
        } else if age < self.visible_for + self.fade_for {
            Phase::Fading
        } else {
            Phase::Removed
        }
    }
}
