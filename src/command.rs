use crate::error::CommandError;

/// One operator command, parsed from a console line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// `G` / `scan`
    Scan,
    /// `L [rad_s]` / `set-limit`; without a value, shows the current limit.
    SetLimit(Option<f32>),
    /// `A <deg>` / `move-to-angle`
    MoveToAngle(f32),
    /// `S <id>` / `reassign-address`
    SetAddress(i64),
    Help,
    Quit,
}

pub const HELP: &str = "commands: G=scan / L <rad_s>=set limit / A <deg>=move to angle / S <id>=reassign address / H=help / Q=quit";

/// Parses one line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let mut tokens = line.split_whitespace();
    let Some(verb) = tokens.next() else {
        return Ok(None);
    };
    let argument = tokens.next();

    let command = match verb.to_ascii_uppercase().as_str() {
        "G" | "SCAN" => Command::Scan,
        "L" | "LIMIT" | "SET-LIMIT" => Command::SetLimit(argument.map(parse_float).transpose()?),
        "A" | "ANGLE" | "MOVE" | "MOVE-TO-ANGLE" => {
            let argument = argument.ok_or(CommandError::MissingArgument("A <deg>"))?;
            Command::MoveToAngle(parse_float(argument)?)
        }
        "S" | "SETID" | "REASSIGN" | "REASSIGN-ADDRESS" => {
            let argument = argument.ok_or(CommandError::MissingArgument("S <id>"))?;
            Command::SetAddress(parse_address(argument)?)
        }
        "H" | "?" | "HELP" => Command::Help,
        "Q" | "QUIT" | "EXIT" => Command::Quit,
        _ => return Err(CommandError::UnknownCommand(verb.to_string())),
    };
    Ok(Some(command))
}

pub fn parse_float(token: &str) -> Result<f32, CommandError> {
    token
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CommandError::InvalidNumber(token.to_string()))
}

/// Decimal, or hexadecimal with a `0x` prefix.
pub fn parse_address(token: &str) -> Result<i64, CommandError> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => token.parse::<i64>(),
    };
    parsed.map_err(|_| CommandError::InvalidNumber(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(parse("g").unwrap(), Some(Command::Scan));
        assert_eq!(parse("SCAN").unwrap(), Some(Command::Scan));
        assert_eq!(parse("q").unwrap(), Some(Command::Quit));
        assert_eq!(parse("Exit").unwrap(), Some(Command::Quit));
        assert_eq!(parse("?").unwrap(), Some(Command::Help));
    }

    #[test]
    fn blank_line_is_not_a_command() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   \t").unwrap(), None);
    }

    #[test]
    fn numeric_arguments() {
        assert_eq!(parse("a 90").unwrap(), Some(Command::MoveToAngle(90.0)));
        assert_eq!(parse("  A   -12.5  ").unwrap(), Some(Command::MoveToAngle(-12.5)));
        assert_eq!(parse("l 4.5").unwrap(), Some(Command::SetLimit(Some(4.5))));
        assert_eq!(parse("L").unwrap(), Some(Command::SetLimit(None)));
        assert_eq!(parse("s 21").unwrap(), Some(Command::SetAddress(21)));
        assert_eq!(parse("S 0x15").unwrap(), Some(Command::SetAddress(0x15)));
        assert_eq!(parse("s -3").unwrap(), Some(Command::SetAddress(-3)));
    }

    #[test]
    fn malformed_numbers_are_reported() {
        assert!(matches!(parse("A ninety"), Err(CommandError::InvalidNumber(t)) if t == "ninety"));
        assert!(matches!(parse("L nan"), Err(CommandError::InvalidNumber(_))));
        assert!(matches!(parse("A inf"), Err(CommandError::InvalidNumber(_))));
        assert!(matches!(parse("S 0xZZ"), Err(CommandError::InvalidNumber(_))));
    }

    #[test]
    fn missing_and_unknown() {
        assert!(matches!(parse("A"), Err(CommandError::MissingArgument(_))));
        assert!(matches!(parse("S"), Err(CommandError::MissingArgument(_))));
        assert!(matches!(parse("X 1"), Err(CommandError::UnknownCommand(v)) if v == "X"));
    }
}
