/**
 * PROFILE LIBRARY - Bibliothèque des profils de cuisson
 *
 * RÔLE : Définitions immuables des trajectoires de température par couple
 * viande/méthode. Chaque profil est une suite ordonnée de phases avec cible,
 * bornes de vitesse, bornes de durée et amplitude de bruit.
 *
 * ARCHITECTURE : presets embarqués + profils additionnels déclarés en YAML,
 * validés au chargement. Données pures, aucun état : le Session Engine tire
 * son aléatoire lui-même.
 */

use crate::config::ProfileConf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("unknown profile: {0}")]
    Unknown(String),
    #[error("profile '{0}' has no phases")]
    Empty(String),
    #[error("profile '{profile}' phase '{phase}': {detail}")]
    InvalidPhase {
        profile: String,
        phase: String,
        detail: String,
    },
}

/// Un segment de profil. Les vitesses sont en °F/minute, les durées en secondes,
/// le bruit en °F appliqué borné à chaque tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub target_f: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub min_secs: u64,
    pub max_secs: u64,
    pub noise_amp: f64,
    pub exit_epsilon: f64,
}

impl Phase {
    /// Une phase de stall a des bornes de vitesse qui encadrent zéro :
    /// plateau bruité, sortie par durée plutôt que par cible.
    pub fn is_stall(&self) -> bool {
        self.rate_min <= 0.0 && self.rate_max >= 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Profile {
    fn validate(&self) -> Result<(), ProfileError> {
        if self.phases.is_empty() {
            return Err(ProfileError::Empty(self.name.clone()));
        }
        for p in &self.phases {
            if p.rate_min > p.rate_max {
                return Err(ProfileError::InvalidPhase {
                    profile: self.name.clone(),
                    phase: p.name.clone(),
                    detail: format!("rate_min {} > rate_max {}", p.rate_min, p.rate_max),
                });
            }
            if p.min_secs > p.max_secs {
                return Err(ProfileError::InvalidPhase {
                    profile: self.name.clone(),
                    phase: p.name.clone(),
                    detail: format!("min_secs {} > max_secs {}", p.min_secs, p.max_secs),
                });
            }
            if p.noise_amp < 0.0 || p.exit_epsilon <= 0.0 {
                return Err(ProfileError::InvalidPhase {
                    profile: self.name.clone(),
                    phase: p.name.clone(),
                    detail: "noise_amp/exit_epsilon hors bornes".into(),
                });
            }
        }
        Ok(())
    }
}

pub struct ProfileLibrary {
    profiles: HashMap<String, Profile>,
}

impl ProfileLibrary {
    /// Presets embarqués. Les constantes numériques sont un choix de
    /// configuration : seule la forme (montée -> stall optionnel -> montée)
    /// est contractuelle.
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        for p in [
            brisket_smoking(),
            pork_shoulder_smoking(),
            ribs_smoking(),
            chicken_grilling(),
            pit_hold(),
        ] {
            profiles.insert(p.name.clone(), p);
        }
        Self { profiles }
    }

    /// Fusionne les profils YAML par-dessus les presets (même nom = override).
    pub fn with_config(mut self, extra: &HashMap<String, ProfileConf>) -> Result<Self, ProfileError> {
        for (name, conf) in extra {
            let profile = Profile {
                name: name.clone(),
                phases: conf
                    .phases
                    .iter()
                    .map(|ph| Phase {
                        name: ph.name.clone(),
                        target_f: ph.target_f,
                        rate_min: ph.rate_min,
                        rate_max: ph.rate_max,
                        min_secs: ph.min_secs,
                        max_secs: ph.max_secs,
                        noise_amp: ph.noise_amp,
                        exit_epsilon: ph.exit_epsilon,
                    })
                    .collect(),
            };
            profile.validate()?;
            self.profiles.insert(name.clone(), profile);
        }
        Ok(self)
    }

    /// Un profil inconnu est une erreur de configuration, détectée à la
    /// création de session et jamais à l'advance.
    pub fn get(&self, name: &str) -> Result<&Profile, ProfileError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ProfileError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Brisket fumé low & slow : montée initiale, stall évaporatif vers 165°F,
/// reprise jusqu'à 203°F (probe tender).
fn brisket_smoking() -> Profile {
    Profile {
        name: "brisket-smoking".into(),
        phases: vec![
            Phase {
                name: "initial-rise".into(),
                target_f: 162.0,
                rate_min: 0.5,
                rate_max: 1.2,
                min_secs: 1800,
                max_secs: 14400,
                noise_amp: 0.6,
                exit_epsilon: 3.0,
            },
            Phase {
                name: "stall".into(),
                target_f: 166.0,
                rate_min: -0.06,
                rate_max: 0.10,
                min_secs: 3600,
                max_secs: 10800,
                noise_amp: 1.8,
                exit_epsilon: 2.0,
            },
            Phase {
                name: "finish-rise".into(),
                target_f: 203.0,
                rate_min: 0.3,
                rate_max: 0.8,
                min_secs: 3600,
                max_secs: 21600,
                noise_amp: 0.5,
                exit_epsilon: 1.5,
            },
        ],
    }
}

fn pork_shoulder_smoking() -> Profile {
    Profile {
        name: "pork-shoulder-smoking".into(),
        phases: vec![
            Phase {
                name: "initial-rise".into(),
                target_f: 158.0,
                rate_min: 0.6,
                rate_max: 1.4,
                min_secs: 1800,
                max_secs: 12600,
                noise_amp: 0.6,
                exit_epsilon: 3.0,
            },
            Phase {
                name: "stall".into(),
                target_f: 163.0,
                rate_min: -0.05,
                rate_max: 0.12,
                min_secs: 2700,
                max_secs: 9000,
                noise_amp: 1.6,
                exit_epsilon: 2.0,
            },
            Phase {
                name: "finish-rise".into(),
                target_f: 198.0,
                rate_min: 0.35,
                rate_max: 0.9,
                min_secs: 2700,
                max_secs: 18000,
                noise_amp: 0.5,
                exit_epsilon: 1.5,
            },
        ],
    }
}

fn ribs_smoking() -> Profile {
    Profile {
        name: "ribs-smoking".into(),
        phases: vec![
            Phase {
                name: "rise".into(),
                target_f: 175.0,
                rate_min: 0.7,
                rate_max: 1.5,
                min_secs: 1800,
                max_secs: 10800,
                noise_amp: 0.7,
                exit_epsilon: 3.0,
            },
            Phase {
                name: "render".into(),
                target_f: 195.0,
                rate_min: 0.2,
                rate_max: 0.6,
                min_secs: 2700,
                max_secs: 10800,
                noise_amp: 0.8,
                exit_epsilon: 2.0,
            },
        ],
    }
}

fn chicken_grilling() -> Profile {
    Profile {
        name: "chicken-grilling".into(),
        phases: vec![
            Phase {
                name: "sear".into(),
                target_f: 120.0,
                rate_min: 2.0,
                rate_max: 4.5,
                min_secs: 300,
                max_secs: 1800,
                noise_amp: 1.2,
                exit_epsilon: 4.0,
            },
            Phase {
                name: "roast".into(),
                target_f: 165.0,
                rate_min: 0.8,
                rate_max: 1.8,
                min_secs: 600,
                max_secs: 3600,
                noise_amp: 0.8,
                exit_epsilon: 2.0,
            },
        ],
    }
}

/// Profil pour sonde d'ambiance : montée du foyer puis maintien de la chambre.
fn pit_hold() -> Profile {
    Profile {
        name: "pit-hold".into(),
        phases: vec![
            Phase {
                name: "light-up".into(),
                target_f: 225.0,
                rate_min: 3.0,
                rate_max: 6.0,
                min_secs: 600,
                max_secs: 3600,
                noise_amp: 1.5,
                exit_epsilon: 5.0,
            },
            Phase {
                name: "hold".into(),
                target_f: 228.0,
                rate_min: -0.10,
                rate_max: 0.10,
                min_secs: 14400,
                max_secs: 43200,
                noise_amp: 2.5,
                exit_epsilon: 3.0,
            },
        ],
    }
}
