//! Audio effect configuration and decoder filter-chain construction
//!
//! Effects never touch the hot path: they compile down to a single filter
//! argument handed to the decoder subprocess before playback starts.

use serde::{Deserialize, Serialize};

/// Structured effect settings
///
/// Every field defaults to "off"; any combination is allowed and the
/// resulting filters are concatenated in a fixed order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EffectSettings {
    /// Pitch shift in semitones (positive is up)
    pub pitch: f32,

    /// Reverb strength, 0.0..=1.0
    pub reverb: f32,

    /// Distortion amount, 0.0..=1.0 (compressor proxy)
    pub distortion: f32,

    /// Plain echo
    pub echo: bool,

    /// Amplitude tremolo
    pub tremolo: bool,

    /// Frequency vibrato
    pub vibrato: bool,

    /// "Robot" spectral transform preset
    pub robot: bool,

    /// "Alien" preset (vibrato + upward resample)
    pub alien: bool,
}

impl EffectSettings {
    /// True when no filter would be produced
    pub fn is_neutral(&self) -> bool {
        self.pitch == 0.0
            && self.reverb == 0.0
            && self.distortion == 0.0
            && !self.echo
            && !self.tremolo
            && !self.vibrato
            && !self.robot
            && !self.alien
    }

    /// Compile into the decoder's audio filter chain
    ///
    /// Returns `None` when neutral so callers can skip the `-af` argument
    /// entirely.
    pub fn filter_chain(&self) -> Option<String> {
        if self.is_neutral() {
            return None;
        }

        let mut parts: Vec<String> = Vec::new();

        if self.pitch != 0.0 {
            let ratio = 2f32.powf(self.pitch / 12.0);
            // asetrate shifts pitch and speed together; atempo undoes the
            // speed change. atempo only accepts 0.5..=2.0.
            let tempo = (1.0 / ratio).clamp(0.5, 2.0);
            parts.push(format!(
                "asetrate=48000*{ratio:.4},aresample=48000,atempo={tempo:.4}"
            ));
        }

        if self.robot {
            parts.push(
                "afftfilt=real='hypot(re,im)*sin(0)':imag='hypot(re,im)*cos(0)':\
                 win_size=512:overlap=0.75"
                    .to_string(),
            );
        }

        if self.alien {
            parts.push("vibrato=f=7:d=0.5,asetrate=48000*1.1,aresample=48000".to_string());
        }

        if self.reverb > 0.0 {
            let strength = self.reverb.clamp(0.0, 1.0);
            let decay1 = 0.25 + 0.5 * strength;
            let decay2 = 0.15 + 0.3 * strength;
            parts.push(format!("aecho=0.8:0.9:40|70:{decay1:.2}|{decay2:.2}"));
        }

        if self.distortion > 0.0 {
            let amount = self.distortion.clamp(0.0, 1.0);
            let threshold = 0.5 - 0.4 * amount;
            let ratio = 2.0 + 18.0 * amount;
            let makeup = 1.0 + 3.0 * amount;
            parts.push(format!(
                "acompressor=threshold={threshold:.2}:ratio={ratio:.1}:attack=5:release=50:\
                 makeup={makeup:.1}"
            ));
        }

        if self.echo {
            parts.push("aecho=0.8:0.88:60:0.4".to_string());
        }

        if self.tremolo {
            parts.push("tremolo=f=8:d=0.8".to_string());
        }

        if self.vibrato {
            parts.push("vibrato=f=6:d=0.5".to_string());
        }

        Some(parts.join(","))
    }
}

/// Playback effect: a named preset or fully structured settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioEffect {
    /// One of the named presets
    Preset(EffectPreset),
    /// Structured settings
    Custom(EffectSettings),
}

/// Named effect presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectPreset {
    None,
    Robot,
    Alien,
    Echo,
    Reverb,
    Pitchup,
    Pitchdown,
}

impl Default for AudioEffect {
    fn default() -> Self {
        AudioEffect::Preset(EffectPreset::None)
    }
}

impl AudioEffect {
    /// Resolve to structured settings
    pub fn settings(&self) -> EffectSettings {
        match self {
            AudioEffect::Custom(settings) => settings.clone(),
            AudioEffect::Preset(preset) => match preset {
                EffectPreset::None => EffectSettings::default(),
                EffectPreset::Robot => EffectSettings {
                    robot: true,
                    ..Default::default()
                },
                EffectPreset::Alien => EffectSettings {
                    alien: true,
                    ..Default::default()
                },
                EffectPreset::Echo => EffectSettings {
                    echo: true,
                    ..Default::default()
                },
                EffectPreset::Reverb => EffectSettings {
                    reverb: 0.6,
                    ..Default::default()
                },
                EffectPreset::Pitchup => EffectSettings {
                    pitch: 3.0,
                    ..Default::default()
                },
                EffectPreset::Pitchdown => EffectSettings {
                    pitch: -3.0,
                    ..Default::default()
                },
            },
        }
    }

    /// Compile into a decoder filter chain, `None` when neutral
    pub fn filter_chain(&self) -> Option<String> {
        self.settings().filter_chain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_has_no_chain() {
        assert!(AudioEffect::default().filter_chain().is_none());
        assert!(EffectSettings::default().filter_chain().is_none());
    }

    #[test]
    fn test_pitch_up_chain() {
        let chain = AudioEffect::Preset(EffectPreset::Pitchup)
            .filter_chain()
            .unwrap();
        assert!(chain.starts_with("asetrate=48000*1.1892"));
        assert!(chain.contains("atempo=0.8409"));
        assert!(chain.contains("aresample=48000"));
    }

    #[test]
    fn test_pitch_down_tempo_above_one() {
        let chain = AudioEffect::Preset(EffectPreset::Pitchdown)
            .filter_chain()
            .unwrap();
        assert!(chain.contains("atempo=1.1892"));
    }

    #[test]
    fn test_combined_chain_order_and_commas() {
        let settings = EffectSettings {
            pitch: 12.0,
            echo: true,
            tremolo: true,
            ..Default::default()
        };
        let chain = settings.filter_chain().unwrap();
        let pitch_at = chain.find("asetrate").unwrap();
        let echo_at = chain.find("aecho").unwrap();
        let tremolo_at = chain.find("tremolo").unwrap();
        assert!(pitch_at < echo_at && echo_at < tremolo_at);
        assert!(!chain.contains(",,"));
    }

    #[test]
    fn test_robot_preset() {
        let chain = AudioEffect::Preset(EffectPreset::Robot)
            .filter_chain()
            .unwrap();
        assert!(chain.contains("afftfilt"));
        assert!(chain.contains("win_size=512"));
    }

    #[test]
    fn test_reverb_scales_with_strength() {
        let weak = EffectSettings {
            reverb: 0.1,
            ..Default::default()
        };
        let strong = EffectSettings {
            reverb: 1.0,
            ..Default::default()
        };
        assert!(weak.filter_chain().unwrap() < strong.filter_chain().unwrap());
    }

    #[test]
    fn test_preset_parses_from_json_string() {
        let effect: AudioEffect = serde_json::from_str("\"robot\"").unwrap();
        assert_eq!(effect, AudioEffect::Preset(EffectPreset::Robot));
    }

    #[test]
    fn test_custom_parses_from_json_object() {
        let effect: AudioEffect =
            serde_json::from_str(r#"{"pitch": 2.0, "echo": true}"#).unwrap();
        match effect {
            AudioEffect::Custom(settings) => {
                assert_eq!(settings.pitch, 2.0);
                assert!(settings.echo);
            }
            other => panic!("unexpected effect: {other:?}"),
        }
    }
}
