// Physical input simulation through enigo.
use std::time::Duration;

use async_trait::async_trait;
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::executor::keys::{KeyCombo, KeyName};
use crate::perception::types::Point;

/// Thin pass-through to OS-level input simulation.
#[async_trait]
pub trait InputDriver: Send + Sync {
    async fn move_click(&self, at: Point) -> DeskPilotResult<()>;

    async fn type_text(&self, text: &str) -> DeskPilotResult<()>;

    async fn send_keys(&self, combo: &KeyCombo) -> DeskPilotResult<()>;

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Opens a fresh enigo connection per action; nothing is kept between calls.
#[derive(Debug, Default)]
pub struct EnigoDriver;

impl EnigoDriver {
    async fn with_enigo<F>(op: &'static str, f: F) -> DeskPilotResult<()>
    where
        F: FnOnce(&mut Enigo) -> Result<(), enigo::InputError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut enigo = Enigo::new(&Settings::default())
                .map_err(|e| DeskPilotError::Input(format!("input connection: {e}")))?;
            f(&mut enigo).map_err(|e| DeskPilotError::Input(format!("{op}: {e}")))
        })
        .await
        .map_err(|e| DeskPilotError::Input(format!("join: {e}")))?
    }
}

#[async_trait]
impl InputDriver for EnigoDriver {
    async fn move_click(&self, at: Point) -> DeskPilotResult<()> {
        tracing::debug!(x = at.x, y = at.y, "mouse click");
        Self::with_enigo("click", move |enigo| {
            enigo.move_mouse(at.x, at.y, Coordinate::Abs)?;
            enigo.button(Button::Left, Direction::Click)
        })
        .await
    }

    async fn type_text(&self, text: &str) -> DeskPilotResult<()> {
        tracing::debug!(chars = text.chars().count(), "typing text");
        let text = text.to_string();
        Self::with_enigo("type", move |enigo| enigo.text(&text)).await
    }

    async fn send_keys(&self, combo: &KeyCombo) -> DeskPilotResult<()> {
        tracing::debug!(keys = %combo, "key chord");
        let modifiers: Vec<Key> = combo.modifiers.iter().map(|k| enigo_key(*k)).collect();
        let key = enigo_key(combo.key);
        Self::with_enigo("keys", move |enigo| {
            let mut pressed = Vec::with_capacity(modifiers.len());
            let mut result = Ok(());
            for m in &modifiers {
                if let Err(e) = enigo.key(*m, Direction::Press) {
                    result = Err(e);
                    break;
                }
                pressed.push(*m);
            }
            if result.is_ok() {
                result = enigo.key(key, Direction::Click);
            }
            // Release whatever went down, even after a failure.
            for m in pressed.iter().rev() {
                let released = enigo.key(*m, Direction::Release);
                if result.is_ok() {
                    result = released;
                }
            }
            result
        })
        .await
    }
}

fn enigo_key(key: KeyName) -> Key {
    match key {
        KeyName::Ctrl => Key::Control,
        KeyName::Alt => Key::Alt,
        KeyName::Shift => Key::Shift,
        KeyName::Super => Key::Meta,
        KeyName::Enter => Key::Return,
        KeyName::Tab => Key::Tab,
        KeyName::Escape => Key::Escape,
        KeyName::Backspace => Key::Backspace,
        KeyName::Delete => Key::Delete,
        KeyName::Space => Key::Space,
        KeyName::Up => Key::UpArrow,
        KeyName::Down => Key::DownArrow,
        KeyName::Left => Key::LeftArrow,
        KeyName::Right => Key::RightArrow,
        KeyName::Home => Key::Home,
        KeyName::End => Key::End,
        KeyName::PageUp => Key::PageUp,
        KeyName::PageDown => Key::PageDown,
        KeyName::F(n) => match n {
            1 => Key::F1,
            2 => Key::F2,
            3 => Key::F3,
            4 => Key::F4,
            5 => Key::F5,
            6 => Key::F6,
            7 => Key::F7,
            8 => Key::F8,
            9 => Key::F9,
            10 => Key::F10,
            11 => Key::F11,
            _ => Key::F12,
        },
        KeyName::Char(c) => Key::Unicode(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(enigo_key(KeyName::Enter), Key::Return);
        assert_eq!(enigo_key(KeyName::F(5)), Key::F5);
        assert_eq!(enigo_key(KeyName::Char('t')), Key::Unicode('t'));
    }
}
