// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publication/subscription bookkeeping for stream flows.
//!
//! Deliberately shallow: just enough state for the protocol engine to
//! dispatch `publish`/`play` and to fan media packets out to listeners.
//! Application-level policy lives outside the engine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Per-media reception statistics over a 10 second sliding window.
#[derive(Debug, Default, Clone)]
pub struct QoS {
    pub dropped_frames: u32,
    pub loss_rate: f64,
    /// Accumulated jitter estimate in milliseconds.
    pub jitter: u32,
    prev_time: u32,
    reception: Duration,
    samples: Vec<(Duration, u32, u32)>,
}

impl QoS {
    const WINDOW: Duration = Duration::from_secs(10);

    /// Record a media message: its timestamp, and how many messages were
    /// lost before it.
    pub fn add(&mut self, now: Duration, tm: u32, received: u32, lost: u32) {
        if self.prev_time > 0 && tm >= self.prev_time {
            let elapsed_real = now.saturating_sub(self.reception).as_millis() as i64;
            let elapsed_media = i64::from(tm - self.prev_time);
            let result = i64::from(self.jitter) + elapsed_real - elapsed_media;
            self.jitter = result.max(0) as u32;
        }
        self.reception = now;
        self.prev_time = tm;
        self.samples
            .retain(|(at, _, _)| *at + Self::WINDOW >= now);
        self.samples.push((now, received, lost));
        let total: u32 = self.samples.iter().map(|(_, r, _)| r).sum();
        let lost: u32 = self.samples.iter().map(|(_, _, l)| l).sum();
        if total != 0 {
            self.loss_rate = f64::from(lost) / f64::from(total + lost);
        }
    }

    pub fn reset(&mut self) {
        *self = QoS::default();
    }
}

/// One subscriber of a publication.
///
/// Holds the ids of the three flow writers on the subscriber's session (the
/// stream flow's own writer plus dedicated audio and video writers) and the
/// timestamp rebase state.
#[derive(Debug)]
pub struct Listener {
    /// Subscriber's stream index.
    pub index: u32,
    /// Session owning the writers below.
    pub session_id: u32,
    pub main_writer: u32,
    pub audio_writer: u32,
    pub video_writer: u32,
    pub unbuffered: bool,
    pub audio_qos: QoS,
    pub video_qos: QoS,
    pub first_key_frame: bool,
    bound_id: u32,
    delta_time: u32,
    adding_time: u32,
    time: u32,
}

impl Listener {
    pub fn new(
        index: u32,
        session_id: u32,
        main_writer: u32,
        audio_writer: u32,
        video_writer: u32,
        unbuffered: bool,
    ) -> Self {
        Self {
            index,
            session_id,
            main_writer,
            audio_writer,
            video_writer,
            unbuffered,
            audio_qos: QoS::default(),
            video_qos: QoS::default(),
            first_key_frame: false,
            bound_id: 0,
            delta_time: 0,
            adding_time: 0,
            time: 0,
        }
    }

    /// Rebase a publisher timestamp into this listener's timeline.
    pub fn compute_time(&mut self, tm: u32) -> u32 {
        let tm = if tm == 0 { 1 } else { tm };
        if self.delta_time == 0 && self.adding_time == 0 {
            self.delta_time = tm;
            log::debug!("[STREAM] listener {} deltatime {}", self.index, tm);
        }
        if self.delta_time > tm {
            log::debug!(
                "[STREAM] time lower than deltaTime on listener {}",
                self.index
            );
            self.delta_time = tm;
        }
        self.time = tm.wrapping_sub(self.delta_time).wrapping_add(self.adding_time);
        self.time
    }

    /// Next bound id for the 0x22 track-bound markers; increments per round.
    pub fn next_bound(&mut self) -> u32 {
        let id = self.bound_id;
        self.bound_id += 1;
        id
    }

    /// Freeze the timeline when the publisher goes away so a new one
    /// continues from where it stopped.
    pub fn on_unpublish(&mut self) {
        self.delta_time = 0;
        self.adding_time = self.time;
        self.audio_qos.reset();
        self.video_qos.reset();
    }
}

/// A named live stream: at most one publisher, any number of listeners.
#[derive(Debug, Default)]
pub struct Publication {
    pub name: String,
    /// Stream index of the publisher; 0 while unpublished.
    pub publisher_id: u32,
    pub listeners: HashMap<u32, Listener>,
    /// Publisher-side reception statistics.
    pub audio_qos: QoS,
    pub video_qos: QoS,
}

/// Stream-id allocation and the live publication table.
#[derive(Debug, Default)]
pub struct Streams {
    next_id: u32,
    live: HashSet<u32>,
    publications: HashMap<String, Publication>,
}

impl Streams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a stream index (never 0, never a live one).
    pub fn create(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.live.contains(&self.next_id) {
                break;
            }
        }
        self.live.insert(self.next_id);
        log::debug!("[STREAM] new stream {}", self.next_id);
        self.next_id
    }

    pub fn destroy(&mut self, index: u32) {
        log::debug!("[STREAM] delete stream {index}");
        self.live.remove(&index);
    }

    pub fn publication(&self, name: &str) -> Option<&Publication> {
        self.publications.get(name)
    }

    pub fn publication_mut(&mut self, name: &str) -> Option<&mut Publication> {
        self.publications.get_mut(name)
    }

    /// Name of the publication fed by the given publisher stream index.
    pub fn publication_by_publisher(&self, index: u32) -> Option<String> {
        self.publications
            .iter()
            .find(|(_, p)| p.publisher_id == index && index != 0)
            .map(|(name, _)| name.clone())
    }

    /// Start publishing `name` from stream `index`. Refused when another
    /// publisher holds the name.
    pub fn publish(&mut self, name: &str, index: u32) -> bool {
        let publication = self
            .publications
            .entry(name.to_string())
            .or_insert_with(|| Publication {
                name: name.to_string(),
                ..Publication::default()
            });
        if publication.publisher_id != 0 && publication.publisher_id != index {
            return false;
        }
        publication.publisher_id = index;
        true
    }

    /// Stop publishing; drops the publication when nobody listens anymore.
    pub fn unpublish(&mut self, name: &str, index: u32) {
        let Some(publication) = self.publications.get_mut(name) else {
            log::debug!("[STREAM] {name} not published, unpublish useless (stream {index})");
            return;
        };
        if publication.publisher_id == index {
            publication.publisher_id = 0;
        }
        for listener in publication.listeners.values_mut() {
            listener.on_unpublish();
        }
        if publication.publisher_id == 0 && publication.listeners.is_empty() {
            self.publications.remove(name);
        }
    }

    pub fn subscribe(&mut self, name: &str, listener: Listener) {
        let publication = self
            .publications
            .entry(name.to_string())
            .or_insert_with(|| Publication {
                name: name.to_string(),
                ..Publication::default()
            });
        if publication.listeners.contains_key(&listener.index) {
            log::debug!(
                "[STREAM] listener {} already subscribed to {name}",
                listener.index
            );
            return;
        }
        publication.listeners.insert(listener.index, listener);
    }

    /// Remove a listener; returns it so the session can close its writers.
    pub fn unsubscribe(&mut self, name: &str, index: u32) -> Option<Listener> {
        let publication = self.publications.get_mut(name)?;
        let listener = publication.listeners.remove(&index);
        if publication.publisher_id == 0 && publication.listeners.is_empty() {
            self.publications.remove(name);
        }
        listener
    }

    /// Drop every listener owned by a dying session and unpublish its
    /// streams.
    pub fn forget_session(&mut self, session_id: u32) {
        for publication in self.publications.values_mut() {
            publication
                .listeners
                .retain(|_, l| l.session_id != session_id);
        }
        self.publications
            .retain(|_, p| p.publisher_id != 0 || !p.listeners.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_skip_zero_and_live() {
        let mut streams = Streams::new();
        let a = streams.create();
        let b = streams.create();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        streams.destroy(a);
        assert!(!streams.live.contains(&a));
    }

    #[test]
    fn second_publisher_is_refused() {
        let mut streams = Streams::new();
        assert!(streams.publish("cam", 1));
        assert!(!streams.publish("cam", 2));
        assert!(streams.publish("cam", 1), "same publisher may re-publish");
        streams.unpublish("cam", 1);
        assert!(streams.publish("cam", 2));
    }

    #[test]
    fn publication_dropped_when_idle() {
        let mut streams = Streams::new();
        streams.publish("cam", 1);
        streams.unpublish("cam", 1);
        assert!(streams.publication("cam").is_none());

        streams.subscribe("cam", Listener::new(5, 9, 1, 2, 3, false));
        assert!(streams.publication("cam").is_some());
        streams.unsubscribe("cam", 5);
        assert!(streams.publication("cam").is_none());
    }

    #[test]
    fn listener_time_rebase() {
        let mut listener = Listener::new(1, 1, 1, 2, 3, false);
        assert_eq!(listener.compute_time(1000), 0);
        assert_eq!(listener.compute_time(1400), 400);
        listener.on_unpublish();
        // New publisher starts its own clock; the frozen timeline is added.
        assert_eq!(listener.compute_time(50), 450);
        assert_eq!(listener.compute_time(250), 650);
    }

    #[test]
    fn qos_loss_rate() {
        let mut qos = QoS::default();
        let t = Duration::from_secs(100);
        qos.add(t, 1000, 1, 0);
        qos.add(t + Duration::from_millis(40), 1040, 1, 1);
        assert!((qos.loss_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn qos_window_expires_old_samples() {
        let mut qos = QoS::default();
        qos.add(Duration::from_secs(1), 10, 1, 1);
        qos.add(Duration::from_secs(30), 2000, 1, 0);
        assert!((qos.loss_rate - 0.0).abs() < 1e-9);
    }
}
