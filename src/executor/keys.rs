//! Key combinations such as `ctrl+alt+t`, `enter` or `f5`.
use std::fmt;
use std::str::FromStr;

use crate::errors::DeskPilotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyName {
    Ctrl,
    Alt,
    Shift,
    Super,
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    F(u8),
    Char(char),
}

impl KeyName {
    pub fn is_modifier(&self) -> bool {
        matches!(self, KeyName::Ctrl | KeyName::Alt | KeyName::Shift | KeyName::Super)
    }

    fn parse(token: &str) -> Option<Self> {
        let key = match token {
            "ctrl" | "control" => KeyName::Ctrl,
            "alt" => KeyName::Alt,
            "shift" => KeyName::Shift,
            "super" | "win" | "meta" | "cmd" => KeyName::Super,
            "enter" | "return" => KeyName::Enter,
            "tab" => KeyName::Tab,
            "esc" | "escape" => KeyName::Escape,
            "backspace" => KeyName::Backspace,
            "delete" | "del" => KeyName::Delete,
            "space" => KeyName::Space,
            "up" => KeyName::Up,
            "down" => KeyName::Down,
            "left" => KeyName::Left,
            "right" => KeyName::Right,
            "home" => KeyName::Home,
            "end" => KeyName::End,
            "pageup" | "page_up" | "pgup" => KeyName::PageUp,
            "pagedown" | "page_down" | "pgdn" => KeyName::PageDown,
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => KeyName::Char(c),
                    (Some('f'), Some(_)) => {
                        let n: u8 = other[1..].parse().ok()?;
                        if !(1..=12).contains(&n) {
                            return None;
                        }
                        KeyName::F(n)
                    }
                    _ => return None,
                }
            }
        };
        Some(key)
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyName::Ctrl => f.write_str("ctrl"),
            KeyName::Alt => f.write_str("alt"),
            KeyName::Shift => f.write_str("shift"),
            KeyName::Super => f.write_str("super"),
            KeyName::Enter => f.write_str("enter"),
            KeyName::Tab => f.write_str("tab"),
            KeyName::Escape => f.write_str("escape"),
            KeyName::Backspace => f.write_str("backspace"),
            KeyName::Delete => f.write_str("delete"),
            KeyName::Space => f.write_str("space"),
            KeyName::Up => f.write_str("up"),
            KeyName::Down => f.write_str("down"),
            KeyName::Left => f.write_str("left"),
            KeyName::Right => f.write_str("right"),
            KeyName::Home => f.write_str("home"),
            KeyName::End => f.write_str("end"),
            KeyName::PageUp => f.write_str("pageup"),
            KeyName::PageDown => f.write_str("pagedown"),
            KeyName::F(n) => write!(f, "f{n}"),
            KeyName::Char(c) => write!(f, "{c}"),
        }
    }
}

/// Modifiers held while `key` is tapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    pub modifiers: Vec<KeyName>,
    pub key: KeyName,
}

impl FromStr for KeyCombo {
    type Err = DeskPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeskPilotError::Input(format!("invalid key combination: {s:?}"));
        let lower = s.trim().to_lowercase();
        let tokens: Vec<&str> = lower
            .split('+')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();

        let (last, rest) = tokens.split_last().ok_or_else(invalid)?;
        let key = KeyName::parse(last).ok_or_else(invalid)?;
        let mut modifiers = Vec::with_capacity(rest.len());
        for token in rest {
            let modifier = KeyName::parse(token).filter(KeyName::is_modifier).ok_or_else(invalid)?;
            if !modifiers.contains(&modifier) {
                modifiers.push(modifier);
            }
        }
        Ok(Self { modifiers, key })
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            write!(f, "{m}+")?;
        }
        write!(f, "{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chord() {
        let combo: KeyCombo = "Ctrl+Alt+T".parse().unwrap();
        assert_eq!(combo.modifiers, vec![KeyName::Ctrl, KeyName::Alt]);
        assert_eq!(combo.key, KeyName::Char('t'));
        assert_eq!(combo.to_string(), "ctrl+alt+t");
    }

    #[test]
    fn test_parse_named_keys() {
        assert_eq!("enter".parse::<KeyCombo>().unwrap().key, KeyName::Enter);
        assert_eq!("PageDown".parse::<KeyCombo>().unwrap().key, KeyName::PageDown);
        assert_eq!("f5".parse::<KeyCombo>().unwrap().key, KeyName::F(5));
        assert_eq!("shift".parse::<KeyCombo>().unwrap().key, KeyName::Shift);
    }

    #[test]
    fn test_reject_garbage() {
        assert!("".parse::<KeyCombo>().is_err());
        assert!("enter+ctrl".parse::<KeyCombo>().is_err());
        assert!("hyperdrive".parse::<KeyCombo>().is_err());
        assert!("f42".parse::<KeyCombo>().is_err());
    }
}
