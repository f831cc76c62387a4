/**
 * SESSION ENGINE - Simulation des cuissons en cours
 *
 * RÔLE : Faire avancer chaque session de cuisson (1 par channel actif) le long
 * des phases de son profil : température suivante = précédente + vitesse*dt + bruit.
 * La vitesse est tirée une fois par phase (pas de re-tirage à chaque tick, sinon
 * jitter irréaliste), le bruit est borné par tick.
 *
 * FONCTIONNEMENT :
 * - Transition de phase : elapsed >= min ET (|temp - cible| <= epsilon OU elapsed >= max)
 * - Stall : bornes de vitesse encadrant zéro + bruit élevé (plateau évaporatif)
 * - Events (lid-open, fuel-add...) : contribution signée à décroissance linéaire,
 *   sommée puis clampée entre plancher ambiant et plafond physique
 * - Connectivité (batterie/signal) : horloge indépendante plus lente, gérée par StatusSim
 *
 * UTILITÉ : C'est la source simulée derrière le Device Adapter; le reste du
 * pipeline ne sait jamais si une lecture vient d'ici ou d'un device réel.
 */

use crate::config::{EventConf, SimConf};
use crate::profiles::{Profile, ProfileError, ProfileLibrary};
use crate::state::{new_state, Shared};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    LidOpen,
    FuelAdd,
    ProbeFlip,
    Basting,
}

impl EventKind {
    /// Signe de la perturbation : ouvrir le couvercle refroidit, recharger chauffe.
    pub fn sign(&self) -> f64 {
        match self {
            EventKind::FuelAdd => 1.0,
            EventKind::LidOpen | EventKind::ProbeFlip | EventKind::Basting => -1.0,
        }
    }

    pub fn default_magnitude(&self) -> f64 {
        match self {
            EventKind::LidOpen => 18.0,
            EventKind::FuelAdd => 12.0,
            EventKind::ProbeFlip => 6.0,
            EventKind::Basting => 9.0,
        }
    }

    pub fn default_decay_secs(&self) -> f64 {
        match self {
            EventKind::LidOpen => 180.0,
            EventKind::FuelAdd => 300.0,
            EventKind::ProbeFlip => 90.0,
            EventKind::Basting => 150.0,
        }
    }

    fn all() -> [EventKind; 4] {
        [EventKind::LidOpen, EventKind::FuelAdd, EventKind::ProbeFlip, EventKind::Basting]
    }
}

/// Perturbation one-shot active sur une session.
#[derive(Debug, Clone, Serialize)]
pub struct CookEvent {
    pub id: String,
    pub kind: EventKind,
    pub magnitude: f64,
    pub decay_secs: f64,
    pub applied_at: OffsetDateTime,
}

impl CookEvent {
    /// Contribution instantanée : magnitude signée décroissant linéairement
    /// jusqu'à zéro sur la fenêtre de decay.
    pub fn contribution(&self, now: OffsetDateTime) -> f64 {
        let age = (now - self.applied_at).as_seconds_f64();
        if age < 0.0 || age >= self.decay_secs {
            return 0.0;
        }
        self.kind.sign() * self.magnitude * (1.0 - age / self.decay_secs)
    }

    pub fn expired(&self, now: OffsetDateTime) -> bool {
        (now - self.applied_at).as_seconds_f64() >= self.decay_secs
    }
}

/// Résultat d'un advance : une valeur, ou le marqueur terminal quand il ne
/// reste plus de phase (c'est l'appelant qui clôt la session).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    Reading(f64),
    Completed,
}

pub struct CookSession {
    pub profile: Profile,
    pub device_id: String,
    pub channel_id: String,
    pub started_at: OffsetDateTime,
    phase_idx: usize,
    phase_elapsed: f64,
    phase_rate: f64,
    temp: f64,
    last_tick: OffsetDateTime,
    events: Vec<CookEvent>,
    rng: StdRng,
}

fn roll_rate(rng: &mut StdRng, phase: &crate::profiles::Phase) -> f64 {
    if phase.rate_max > phase.rate_min {
        rng.gen_range(phase.rate_min..=phase.rate_max)
    } else {
        phase.rate_min
    }
}

impl CookSession {
    pub fn new(
        profile: Profile,
        device_id: &str,
        channel_id: &str,
        start_temp: f64,
        now: OffsetDateTime,
        mut rng: StdRng,
    ) -> Self {
        let phase_rate = profile
            .phases
            .first()
            .map(|p| roll_rate(&mut rng, p))
            .unwrap_or(0.0);
        Self {
            profile,
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            started_at: now,
            phase_idx: 0,
            phase_elapsed: 0.0,
            phase_rate,
            temp: start_temp,
            last_tick: now,
            events: Vec::new(),
            rng,
        }
    }

    pub fn phase_name(&self) -> Option<&str> {
        self.profile.phases.get(self.phase_idx).map(|p| p.name.as_str())
    }

    pub fn phase_index(&self) -> usize {
        self.phase_idx
    }

    pub fn current_temp(&self) -> f64 {
        self.temp
    }

    pub fn push_event(
        &mut self,
        kind: EventKind,
        magnitude: Option<f64>,
        decay_secs: Option<f64>,
        now: OffsetDateTime,
    ) {
        self.events.push(CookEvent {
            id: Uuid::new_v4().to_string(),
            kind,
            magnitude: magnitude.unwrap_or_else(|| kind.default_magnitude()),
            decay_secs: decay_secs.unwrap_or_else(|| kind.default_decay_secs()),
            applied_at: now,
        });
    }

    /// Un tick de simulation. `now` doit être strictement croissant entre appels;
    /// un now en retard est traité comme dt=0 (lecture répétée, jamais de retour
    /// en arrière de la trajectoire).
    pub fn advance(&mut self, now: OffsetDateTime, sim: &SimConf, events: &EventConf) -> Advance {
        let Some(phase) = self.profile.phases.get(self.phase_idx).cloned() else {
            return Advance::Completed;
        };
        let dt = (now - self.last_tick).as_seconds_f64().max(0.0);
        self.last_tick = now;

        // la trajectoire de base n'avance qu'à la vitesse de phase : le bruit
        // reste borné par tick, il perturbe la lecture émise sans s'accumuler
        // (sinon marche aléatoire, plus de plateau pendant le stall)
        self.temp += self.phase_rate / 60.0 * dt;
        // la cible de phase est une asymptote : la trajectoire ne la traverse
        // pas (hors stall, où la dérive autour du plateau est voulue)
        if !phase.is_stall() {
            if self.phase_rate > 0.0 {
                self.temp = self.temp.min(phase.target_f);
            } else if self.phase_rate < 0.0 {
                self.temp = self.temp.max(phase.target_f);
            }
        }
        self.temp = self.temp.clamp(sim.ambient_floor_f, sim.hard_ceiling_f);
        self.phase_elapsed += dt;

        // injection spontanée : probabilité par unité de temps, configurée
        let p_event = events.random_per_hour / 3600.0 * dt;
        if p_event > 0.0 && self.rng.gen::<f64>() < p_event {
            let kind = EventKind::all()[self.rng.gen_range(0..4)];
            self.push_event(kind, None, None, now);
        }

        let noise = if phase.noise_amp > 0.0 {
            self.rng.gen_range(-phase.noise_amp..=phase.noise_amp)
        } else {
            0.0
        };
        // events et bruit modifient la lecture émise, pas la trajectoire
        let contribution: f64 = self.events.iter().map(|e| e.contribution(now)).sum();
        let reading =
            (self.temp + noise + contribution).clamp(sim.ambient_floor_f, sim.hard_ceiling_f);
        self.events.retain(|e| !e.expired(now));

        let done = self.phase_elapsed >= phase.min_secs as f64
            && ((self.temp - phase.target_f).abs() <= phase.exit_epsilon
                || self.phase_elapsed >= phase.max_secs as f64);
        if done {
            self.phase_idx += 1;
            self.phase_elapsed = 0.0;
            if let Some(next) = self.profile.phases.get(self.phase_idx) {
                // nouvelle vitesse tirée à l'entrée de phase
                self.phase_rate = roll_rate(&mut self.rng, next);
            }
        }
        Advance::Reading(reading)
    }
}

/// Simulation de connectivité, avancée sur une horloge plus lente que le poll.
pub struct StatusSim {
    battery: f64,
    signal: f64,
    rng: StdRng,
}

impl StatusSim {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self { battery: 100.0, signal: 88.0, rng }
    }

    /// Avance d'un pas : batterie monotone décroissante avec reset occasionnel
    /// (recharge/échange), signal en marche aléatoire dans sa bande avec une
    /// faible probabilité de chute transitoire sous le seuil - un tick seulement,
    /// la valeur persistée ne bouge pas.
    pub fn tick(&mut self, sim: &SimConf) -> (f32, f32) {
        self.battery -= self.rng.gen_range(0.02..0.15);
        if self.battery <= 1.0 || self.rng.gen::<f64>() < 0.002 {
            self.battery = self.rng.gen_range(96.0..100.0);
        }
        self.battery = self.battery.clamp(0.0, 100.0);

        let band_floor = sim.signal_threshold_pct as f64 + 10.0;
        let step = Normal::new(0.0, 2.0).unwrap().sample(&mut self.rng);
        self.signal = (self.signal + step).clamp(band_floor, 98.0);

        let emitted = if self.rng.gen::<f64>() < 0.01 {
            self.rng.gen_range(2.0..(sim.signal_threshold_pct as f64).max(3.0))
        } else {
            self.signal
        };
        (self.battery as f32, emitted as f32)
    }
}

impl Default for StatusSim {
    fn default() -> Self {
        Self::new()
    }
}

/// Vue API d'une session active.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub device_id: String,
    pub channel_id: String,
    pub profile: String,
    pub phase: Option<String>,
    pub phase_index: usize,
    pub started_at: String,
    pub current_temp: f64,
}

/// Registre des sessions actives, partagé entre l'API HTTP (création/stop/
/// injection) et la source simulée (advance). Une seule map sous verrou :
/// stop et advance ne peuvent pas se courser, et stop est idempotent.
pub struct SessionManager {
    sessions: Shared<HashMap<String, CookSession>>,
    library: Arc<ProfileLibrary>,
    sim: SimConf,
    events: EventConf,
}

fn session_key(device_id: &str, channel_id: &str) -> String {
    format!("{device_id}/{channel_id}")
}

impl SessionManager {
    pub fn new(library: Arc<ProfileLibrary>, sim: SimConf, events: EventConf) -> Self {
        Self {
            sessions: new_state(HashMap::new()),
            library,
            sim,
            events,
        }
    }

    /// Crée (ou remplace : réassignation) la session d'un channel.
    /// Profil inconnu = erreur de configuration, rejetée ici.
    pub fn start(
        &self,
        device_id: &str,
        channel_id: &str,
        profile_name: &str,
        now: OffsetDateTime,
    ) -> Result<(), ProfileError> {
        let profile = self.library.get(profile_name)?.clone();
        let session = CookSession::new(
            profile,
            device_id,
            channel_id,
            self.sim.start_temp_f,
            now,
            StdRng::from_entropy(),
        );
        self.sessions
            .lock()
            .insert(session_key(device_id, channel_id), session);
        println!("[session] started '{profile_name}' on {device_id}/{channel_id}");
        Ok(())
    }

    /// Arrêt idempotent; retourne false si rien n'était actif.
    pub fn stop(&self, device_id: &str, channel_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .remove(&session_key(device_id, channel_id))
            .is_some();
        if removed {
            println!("[session] stopped {device_id}/{channel_id}");
        }
        removed
    }

    /// Coupe toutes les sessions d'un device (déconnexion). Idempotent.
    pub fn stop_device(&self, device_id: &str) -> usize {
        let prefix = format!("{device_id}/");
        let mut map = self.sessions.lock();
        let before = map.len();
        map.retain(|k, _| !k.starts_with(&prefix));
        before - map.len()
    }

    pub fn inject_event(
        &self,
        device_id: &str,
        channel_id: &str,
        kind: EventKind,
        magnitude: Option<f64>,
        decay_secs: Option<f64>,
        now: OffsetDateTime,
    ) -> bool {
        let mut map = self.sessions.lock();
        match map.get_mut(&session_key(device_id, channel_id)) {
            Some(s) => {
                s.push_event(kind, magnitude, decay_secs, now);
                true
            }
            None => false,
        }
    }

    /// Avance la session d'un channel. `None` = pas de session (pas de lecture).
    /// Sur `Completed` la session est retirée ici même : l'appelant n'a que le
    /// marqueur à propager.
    pub fn advance_channel(
        &self,
        device_id: &str,
        channel_id: &str,
        now: OffsetDateTime,
    ) -> Option<Advance> {
        let key = session_key(device_id, channel_id);
        let mut map = self.sessions.lock();
        let session = map.get_mut(&key)?;
        let advance = session.advance(now, &self.sim, &self.events);
        if advance == Advance::Completed {
            map.remove(&key);
            println!("[session] profile completed on {key}");
        }
        Some(advance)
    }

    pub fn active(&self) -> Vec<SessionView> {
        self.sessions
            .lock()
            .values()
            .map(|s| SessionView {
                device_id: s.device_id.clone(),
                channel_id: s.channel_id.clone(),
                profile: s.profile.name.clone(),
                phase: s.phase_name().map(str::to_string),
                phase_index: s.phase_index(),
                started_at: crate::models::fmt_rfc3339(s.started_at),
                current_temp: s.current_temp(),
            })
            .collect()
    }

    pub fn has_session(&self, device_id: &str, channel_id: &str) -> bool {
        self.sessions
            .lock()
            .contains_key(&session_key(device_id, channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ProfileLibrary;
    use time::Duration;

    fn test_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn quiet_events() -> EventConf {
        EventConf { random_per_hour: 0.0 }
    }

    fn brisket_session(seed: u64) -> CookSession {
        let lib = ProfileLibrary::builtin();
        let profile = lib.get("brisket-smoking").unwrap().clone();
        CookSession::new(
            profile,
            "grill-1",
            "probe-1",
            40.0,
            OffsetDateTime::UNIX_EPOCH,
            StdRng::seed_from_u64(seed),
        )
    }

    #[test]
    fn rise_phase_moves_toward_target() {
        let sim = SimConf::default();
        let events = quiet_events();
        let mut s = brisket_session(7);
        let mut now = OffsetDateTime::UNIX_EPOCH;
        let start = s.current_temp();
        let mut prev = start;
        // 90 ticks de 5s : on reste dans la première phase quelle que soit la
        // vitesse tirée
        for _ in 0..90 {
            now += Duration::seconds(5);
            match s.advance(now, &sim, &events) {
                Advance::Reading(_) => {}
                Advance::Completed => panic!("completed trop tôt"),
            }
            let t = s.current_temp();
            // trajectoire de base monotone vers la cible en phase de montée
            assert!(t >= prev);
            prev = t;
        }
        assert!(s.current_temp() > start + 2.0, "la montée doit progresser");
    }

    #[test]
    fn rate_is_rolled_once_per_phase() {
        let mut s = brisket_session(11);
        let rate_before = s.phase_rate;
        let sim = SimConf::default();
        let events = quiet_events();
        let mut now = OffsetDateTime::UNIX_EPOCH;
        for _ in 0..50 {
            now += Duration::seconds(5);
            s.advance(now, &sim, &events);
        }
        assert_eq!(s.phase_index(), 0);
        assert_eq!(s.phase_rate, rate_before);
    }

    #[test]
    fn lid_open_dips_then_fully_decays() {
        let sim = SimConf::default();
        let events = quiet_events();
        let mut s = brisket_session(13);
        let mut now = OffsetDateTime::UNIX_EPOCH;

        now += Duration::seconds(5);
        let base = match s.advance(now, &sim, &events) {
            Advance::Reading(v) => v,
            _ => unreachable!(),
        };
        s.push_event(EventKind::LidOpen, Some(20.0), Some(60.0), now);

        now += Duration::seconds(5);
        let dipped = match s.advance(now, &sim, &events) {
            Advance::Reading(v) => v,
            _ => unreachable!(),
        };
        // creux visible, borné par la magnitude de l'event
        assert!(dipped < base);
        assert!(base - dipped <= 20.0 + s.profile.phases[0].noise_amp * 2.0 + 1.0);

        // après la fenêtre de decay, plus aucune contribution
        now += Duration::seconds(70);
        s.advance(now, &sim, &events);
        assert!(s.events.is_empty());
    }

    #[test]
    fn simultaneous_events_sum_and_clamp() {
        let sim = SimConf::default();
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut s = brisket_session(17);
        s.push_event(EventKind::LidOpen, Some(500.0), Some(60.0), now);
        s.push_event(EventKind::LidOpen, Some(500.0), Some(60.0), now);
        let events = quiet_events();
        match s.advance(now + Duration::seconds(1), &sim, &events) {
            Advance::Reading(v) => assert!(v >= sim.ambient_floor_f),
            _ => unreachable!(),
        }
    }

    #[test]
    fn exhausted_profile_returns_terminal_marker() {
        let lib = ProfileLibrary::builtin();
        let profile = lib.get("chicken-grilling").unwrap().clone();
        let mut s = CookSession::new(
            profile,
            "grill-1",
            "probe-1",
            40.0,
            OffsetDateTime::UNIX_EPOCH,
            test_rng(),
        );
        s.phase_idx = 2; // au-delà de la dernière phase
        let sim = SimConf::default();
        let out = s.advance(OffsetDateTime::UNIX_EPOCH + Duration::seconds(5), &sim, &quiet_events());
        assert_eq!(out, Advance::Completed);
    }

    #[test]
    fn manager_stop_is_idempotent_and_discards_in_flight_result() {
        let lib = Arc::new(ProfileLibrary::builtin());
        let mgr = SessionManager::new(lib, SimConf::default(), quiet_events());
        let now = OffsetDateTime::UNIX_EPOCH;
        mgr.start("grill-1", "probe-1", "brisket-smoking", now).unwrap();
        assert!(mgr.stop("grill-1", "probe-1"));
        assert!(!mgr.stop("grill-1", "probe-1"));
        // plus de session : l'advance ne produit rien à appliquer
        assert!(mgr
            .advance_channel("grill-1", "probe-1", now + Duration::seconds(5))
            .is_none());
    }

    #[test]
    fn unknown_profile_rejected_at_creation() {
        let lib = Arc::new(ProfileLibrary::builtin());
        let mgr = SessionManager::new(lib, SimConf::default(), quiet_events());
        let res = mgr.start("grill-1", "probe-1", "licorne-grillée", OffsetDateTime::UNIX_EPOCH);
        assert!(res.is_err());
        assert!(!mgr.has_session("grill-1", "probe-1"));
    }

    #[test]
    fn status_sim_battery_is_monotonic_between_resets() {
        let sim = SimConf::default();
        let mut status = StatusSim::with_rng(StdRng::seed_from_u64(5));
        let mut prev = 100.0_f32;
        for _ in 0..200 {
            let (battery, signal) = status.tick(&sim);
            // soit décroissance, soit reset franc vers le plein
            assert!(battery <= prev || battery >= 96.0);
            assert!((0.0..=100.0).contains(&battery));
            assert!(signal <= 98.0);
            prev = battery;
        }
    }
}
