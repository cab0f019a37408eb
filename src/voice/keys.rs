//! Push-to-talk key state
//!
//! The key loop samples [`KeySource::is_down`] on a fixed interval. The
//! production source runs an `rdev` global listener on its own thread and
//! keeps the latest level of one key in an atomic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rdev::{EventType, Key};

use crate::{Error, Result};

/// Current level of the push-to-talk key
pub trait KeySource: Send + Sync {
    /// Whether the key is held right now
    fn is_down(&self) -> bool;
}

/// Global keyboard hook tracking one key
pub struct GlobalKey {
    down: Arc<AtomicBool>,
}

impl GlobalKey {
    /// Start listening for `key`
    ///
    /// The listener thread lives for the rest of the process; `rdev` has no
    /// way to unhook it.
    ///
    /// # Errors
    ///
    /// Returns error if the listener thread cannot be spawned
    pub fn spawn(key: Key) -> Result<Self> {
        let down = Arc::new(AtomicBool::new(false));
        let level = Arc::clone(&down);

        std::thread::Builder::new()
            .name("talkback-keys".to_string())
            .spawn(move || {
                let result = rdev::listen(move |event| match event.event_type {
                    EventType::KeyPress(k) if k == key => level.store(true, Ordering::Release),
                    EventType::KeyRelease(k) if k == key => level.store(false, Ordering::Release),
                    _ => {}
                });
                if let Err(e) = result {
                    tracing::error!(error = ?e, "keyboard listener failed");
                }
            })?;

        tracing::debug!(key = ?key, "keyboard listener started");
        Ok(Self { down })
    }
}

impl KeySource for GlobalKey {
    fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }
}

const LETTERS: [Key; 26] = [
    Key::KeyA,
    Key::KeyB,
    Key::KeyC,
    Key::KeyD,
    Key::KeyE,
    Key::KeyF,
    Key::KeyG,
    Key::KeyH,
    Key::KeyI,
    Key::KeyJ,
    Key::KeyK,
    Key::KeyL,
    Key::KeyM,
    Key::KeyN,
    Key::KeyO,
    Key::KeyP,
    Key::KeyQ,
    Key::KeyR,
    Key::KeyS,
    Key::KeyT,
    Key::KeyU,
    Key::KeyV,
    Key::KeyW,
    Key::KeyX,
    Key::KeyY,
    Key::KeyZ,
];

const DIGITS: [Key; 10] = [
    Key::Num0,
    Key::Num1,
    Key::Num2,
    Key::Num3,
    Key::Num4,
    Key::Num5,
    Key::Num6,
    Key::Num7,
    Key::Num8,
    Key::Num9,
];

const FUNCTION_KEYS: [Key; 12] = [
    Key::F1,
    Key::F2,
    Key::F3,
    Key::F4,
    Key::F5,
    Key::F6,
    Key::F7,
    Key::F8,
    Key::F9,
    Key::F10,
    Key::F11,
    Key::F12,
];

/// Parse a key name such as `space`, `f8`, `ctrl` or `k`
///
/// # Errors
///
/// Returns `Error::Config` for names that do not map to a key
pub fn parse_key(name: &str) -> Result<Key> {
    let lower = name.trim().to_ascii_lowercase();

    let key = match lower.as_str() {
        "space" => Key::Space,
        "enter" | "return" => Key::Return,
        "tab" => Key::Tab,
        "escape" | "esc" => Key::Escape,
        "backspace" => Key::Backspace,
        "capslock" | "caps_lock" => Key::CapsLock,
        "ctrl" | "control" | "lctrl" => Key::ControlLeft,
        "rctrl" => Key::ControlRight,
        "alt" | "lalt" => Key::Alt,
        "altgr" | "ralt" => Key::AltGr,
        "shift" | "lshift" => Key::ShiftLeft,
        "rshift" => Key::ShiftRight,
        "meta" | "super" | "cmd" => Key::MetaLeft,
        "insert" | "ins" => Key::Insert,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "pgup" => Key::PageUp,
        "pagedown" | "pgdn" => Key::PageDown,
        "scrolllock" | "scroll" => Key::ScrollLock,
        "pause" => Key::Pause,
        other => return single_key(other).ok_or_else(|| unknown(name)),
    };
    Ok(key)
}

fn single_key(name: &str) -> Option<Key> {
    if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<usize>().ok()) {
        return n.checked_sub(1).and_then(|i| FUNCTION_KEYS.get(i)).copied();
    }

    let mut chars = name.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return None;
    };

    match c {
        'a'..='z' => LETTERS.get(usize::from(c as u8 - b'a')).copied(),
        '0'..='9' => DIGITS.get(usize::from(c as u8 - b'0')).copied(),
        _ => None,
    }
}

fn unknown(name: &str) -> Error {
    Error::Config(format!("unknown push-to-talk key: {name:?}"))
}
