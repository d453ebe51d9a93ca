use serde::Deserialize;

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PumpOn,
    PumpOff,
    /// Anything we don't recognise, kept verbatim for logging.
    Unknown(String),
}

/// JSON envelope the server sends: `{"command": "PUMP_ON", ...}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
}

/// Parse a command payload: either a bare word (`PUMP_ON`) or a JSON object
/// with a `command` field.  Case-insensitive, trims whitespace.
pub fn parse_command(payload: &[u8]) -> Command {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();

    let word = if trimmed.starts_with('{') {
        match serde_json::from_str::<Envelope>(trimmed) {
            Ok(env) => env.command,
            Err(_) => return Command::Unknown(trimmed.to_string()),
        }
    } else {
        trimmed.to_string()
    };

    match word.trim().to_uppercase().as_str() {
        "PUMP_ON" => Command::PumpOn,
        "PUMP_OFF" => Command::PumpOff,
        _ => Command::Unknown(trimmed.to_string()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
