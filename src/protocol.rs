use crate::error::ControlError;
use crate::types::{NUM_ANALOG, NUM_DIGITAL, NUM_RELAYS};

// Wire constants
pub const READY_TOKEN: &str = "ARDUINO_READY";
pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
pub const TIMEOUT: &str = "TIMEOUT";
pub const STATUS_PREFIX: &str = "STATUS:";
pub const DIGITAL_PREFIX: &str = "DIGITAL_INPUTS:";
pub const ANALOG_PREFIX: &str = "ANALOG_INPUTS:";
pub const ADC_MAX: f64 = 1023.0;
pub const ADC_REFERENCE_VOLTS: f64 = 5.0;

/// Unsolicited lines that mean the firmware has latched a safety halt
pub const HAZARD_TOKENS: [&str; 3] = [
    "CRITICAL_SAFETY_ERROR",
    "ARDUINO_SAFETY_HALT",
    "LOAD-LOCK ARM IS NOT IN HOME POSITION",
];

/// Commands understood by the relay controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Relay { index: u8, on: bool },
    AllOff,
    Status,
    DigitalInputs,
    AnalogInputs,
}

impl Command {
    pub fn relay(index: u8, on: bool) -> Result<Self, ControlError> {
        if index == 0 || index as usize > NUM_RELAYS {
            return Err(ControlError::InvalidRelay(index));
        }
        Ok(Command::Relay { index, on })
    }

    /// Switches something on. Refused while the controller is halted.
    pub fn energizes(&self) -> bool {
        matches!(self, Command::Relay { on: true, .. })
    }

    pub fn to_wire(&self) -> String {
        match self {
            Command::Relay { index, on } => {
                format!("RELAY_{}_{}", index, if *on { "ON" } else { "OFF" })
            }
            Command::AllOff => "ALL_OFF".to_string(),
            Command::Status => "STATUS".to_string(),
            Command::DigitalInputs => "GET_DIGITAL_INPUTS".to_string(),
            Command::AnalogInputs => "GET_ANALOG_INPUTS".to_string(),
        }
    }

    /// Prefixes that complete this command's response
    pub fn expected_prefixes(&self) -> &'static [&'static str] {
        match self {
            Command::Relay { .. } | Command::AllOff => &[OK, ERROR],
            Command::Status => &[STATUS_PREFIX],
            Command::DigitalInputs => &[DIGITAL_PREFIX],
            Command::AnalogInputs => &[ANALOG_PREFIX],
        }
    }
}

/// Parse a raw command line back into a [`Command`]. Used by the simulated controller.
pub fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "ALL_OFF" => Some(Command::AllOff),
        "STATUS" => Some(Command::Status),
        "GET_DIGITAL_INPUTS" => Some(Command::DigitalInputs),
        "GET_ANALOG_INPUTS" => Some(Command::AnalogInputs),
        other => {
            let rest = other.strip_prefix("RELAY_")?;
            let (index, state) = rest.split_once('_')?;
            let index: u8 = index.parse().ok()?;
            let on = match state {
                "ON" => true,
                "OFF" => false,
                _ => return None,
            };
            Command::relay(index, on).ok()
        }
    }
}

pub fn is_hazard(line: &str) -> bool {
    HAZARD_TOKENS.iter().any(|t| line.contains(t))
}

pub fn matches_expected(line: &str, expected: &[&str]) -> bool {
    expected.iter().any(|prefix| line.starts_with(prefix))
}

/// A line that can answer a raw command. Hazards and ready announcements
/// arrive unsolicited.
pub fn is_answer(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !is_hazard(line) && !line.contains(READY_TOKEN)
}

fn csv_body<'a>(line: &'a str, prefix: &str) -> Result<&'a str, ControlError> {
    line.trim()
        .strip_prefix(prefix)
        .ok_or_else(|| ControlError::Protocol(format!("expected '{}', got '{}'", prefix, line)))
}

fn parse_bits(body: &str) -> Result<Vec<bool>, ControlError> {
    body.split(',')
        .map(|field| match field.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(ControlError::Protocol(format!("bad bit '{}'", other))),
        })
        .collect()
}

/// `STATUS:1,0,...` into 23 relay states, index 0 is relay 1
pub fn parse_status(line: &str) -> Result<Vec<bool>, ControlError> {
    let bits = parse_bits(csv_body(line, STATUS_PREFIX)?)?;
    if bits.len() != NUM_RELAYS {
        return Err(ControlError::Protocol(format!(
            "STATUS carried {} relays, expected {}",
            bits.len(),
            NUM_RELAYS
        )));
    }
    Ok(bits)
}

pub fn parse_digital(line: &str) -> Result<[bool; NUM_DIGITAL], ControlError> {
    let bits = parse_bits(csv_body(line, DIGITAL_PREFIX)?)?;
    bits.try_into().map_err(|bits: Vec<bool>| {
        ControlError::Protocol(format!(
            "DIGITAL_INPUTS carried {} values, expected {}",
            bits.len(),
            NUM_DIGITAL
        ))
    })
}

/// Raw 10-bit ADC counts
pub fn parse_analog_raw(line: &str) -> Result<[u16; NUM_ANALOG], ControlError> {
    let values = csv_body(line, ANALOG_PREFIX)?
        .split(',')
        .map(|field| {
            field
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|v| *v <= ADC_MAX as u16)
                .ok_or_else(|| ControlError::Protocol(format!("bad ADC value '{}'", field)))
        })
        .collect::<Result<Vec<u16>, _>>()?;
    values.try_into().map_err(|values: Vec<u16>| {
        ControlError::Protocol(format!(
            "ANALOG_INPUTS carried {} values, expected {}",
            values.len(),
            NUM_ANALOG
        ))
    })
}

pub fn raw_to_volts(raw: u16) -> f64 {
    raw as f64 * ADC_REFERENCE_VOLTS / ADC_MAX
}

pub fn volts_to_raw(volts: f64) -> u16 {
    (volts.clamp(0.0, ADC_REFERENCE_VOLTS) * ADC_MAX / ADC_REFERENCE_VOLTS).round() as u16
}

pub fn format_bits(prefix: &str, bits: &[bool]) -> String {
    let body: Vec<&str> = bits.iter().map(|b| if *b { "1" } else { "0" }).collect();
    format!("{}{}", prefix, body.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_command_wire_format() {
        assert_eq!(Command::relay(6, true).unwrap().to_wire(), "RELAY_6_ON");
        assert_eq!(Command::relay(23, false).unwrap().to_wire(), "RELAY_23_OFF");
        assert!(Command::relay(0, true).is_err());
        assert!(Command::relay(24, true).is_err());
    }

    #[test]
    fn parse_command_rejects_garbage() {
        assert_eq!(parse_command("RELAY_3_ON"), Some(Command::Relay { index: 3, on: true }));
        assert_eq!(parse_command("STATUS\r"), Some(Command::Status));
        assert_eq!(parse_command("RELAY_3_MAYBE"), None);
        assert_eq!(parse_command("RELAY_99_ON"), None);
        assert_eq!(parse_command("HELLO"), None);
    }

    #[test]
    fn status_requires_all_relays() {
        let mut bits = vec![false; NUM_RELAYS];
        bits[5] = true;
        let parsed = parse_status(&format_bits(STATUS_PREFIX, &bits)).unwrap();
        assert!(parsed[5]);
        assert!(parse_status("STATUS:1,0,1").is_err());
        assert!(parse_status("DIGITAL_INPUTS:1,0,1,0").is_err());
    }

    #[test]
    fn analog_values_convert_to_volts() {
        let raw = parse_analog_raw("ANALOG_INPUTS:0,1023,512,600").unwrap();
        assert_eq!(raw, [0, 1023, 512, 600]);
        assert_eq!(raw_to_volts(1023), 5.0);
        assert!((raw_to_volts(512) - 2.5024).abs() < 1e-3);
        assert!(parse_analog_raw("ANALOG_INPUTS:0,1024,0,0").is_err());
        assert!(parse_analog_raw("ANALOG_INPUTS:0,1,2").is_err());
    }

    #[test]
    fn digital_parse() {
        assert_eq!(
            parse_digital("DIGITAL_INPUTS:1,0,1,0").unwrap(),
            [true, false, true, false]
        );
        assert!(parse_digital("DIGITAL_INPUTS:1,0,x,0").is_err());
    }

    #[test]
    fn hazard_tokens_are_detected_inside_lines() {
        assert!(is_hazard("!!! LOAD-LOCK ARM IS NOT IN HOME POSITION !!!"));
        assert!(is_hazard("ARDUINO_SAFETY_HALT"));
        assert!(!is_hazard("ARDUINO_READY"));
    }

    #[test]
    fn announcements_are_not_answers() {
        assert!(is_answer("STATUS:0,0,0"));
        assert!(is_answer("OK"));
        assert!(!is_answer("ARDUINO_READY"));
        assert!(!is_answer("CRITICAL_SAFETY_ERROR"));
        assert!(!is_answer("  \r"));
    }

    #[test]
    fn only_relay_on_energizes() {
        assert!(Command::relay(4, true).unwrap().energizes());
        assert!(!Command::relay(4, false).unwrap().energizes());
        assert!(!Command::AllOff.energizes());
        assert!(!Command::Status.energizes());
    }
}
