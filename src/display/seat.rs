//! Seat capability wiring and input translation
//!
//! Each seat groups one logical pointer/keyboard/touch set. Capability
//! events attach and detach the device objects; the device dispatch
//! handlers below feed the pure state machines and forward the derived
//! events to the active engine through the display's [`super::EventSink`].

use std::fs::File;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};
use wayland_client::protocol::{wl_keyboard, wl_pointer, wl_seat, wl_touch};
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};

use super::keyboard::KeyboardState;
use super::pointer::PointerState;
use super::touch::TouchTracker;
use super::DisplayState;
use crate::engine::{KeyEvent, PointerDeviceKind, PointerEvent, PointerPhase};
use crate::timer::EventTimer;

/// Per-seat device objects and input state machines
pub(super) struct Seat {
    pub(super) seat: wl_seat::WlSeat,
    pointer: Option<wl_pointer::WlPointer>,
    keyboard: Option<wl_keyboard::WlKeyboard>,
    touch: Option<wl_touch::WlTouch>,
    pointer_state: PointerState,
    touch_tracker: TouchTracker,
    keyboard_state: KeyboardState,
    repeat_timer: Option<EventTimer>,
    /// Axis deltas accumulated until the pointer frame event
    pending_scroll: (f64, f64),
    last_time_ms: u32,
}

impl Seat {
    pub(super) fn new(seat: wl_seat::WlSeat, repeat_rate: u32, repeat_delay_ms: u32) -> Self {
        Self {
            seat,
            pointer: None,
            keyboard: None,
            touch: None,
            pointer_state: PointerState::new(),
            touch_tracker: TouchTracker::new(),
            keyboard_state: KeyboardState::new(repeat_rate, repeat_delay_ms),
            repeat_timer: None,
            pending_scroll: (0.0, 0.0),
            last_time_ms: 0,
        }
    }
}

impl DisplayState {
    fn seat_index_for_pointer(&self, pointer: &wl_pointer::WlPointer) -> Option<usize> {
        self.seats
            .iter()
            .position(|s| s.pointer.as_ref().map(|p| p.id()) == Some(pointer.id()))
    }

    fn seat_index_for_keyboard(&self, keyboard: &wl_keyboard::WlKeyboard) -> Option<usize> {
        self.seats
            .iter()
            .position(|s| s.keyboard.as_ref().map(|k| k.id()) == Some(keyboard.id()))
    }

    fn seat_index_for_touch(&self, touch: &wl_touch::WlTouch) -> Option<usize> {
        self.seats
            .iter()
            .position(|s| s.touch.as_ref().map(|t| t.id()) == Some(touch.id()))
    }

    /// Emits a pointer sample for the active engine; events with no mapped
    /// engine are dropped silently
    fn emit_pointer(&mut self, seat_index: usize, phase: PointerPhase, time_ms: u32) {
        let Some(slot) = self.active_slot else {
            return;
        };
        let seat = &self.seats[seat_index];
        let (x, y) = seat.pointer_state.position();
        let event = PointerEvent::sample(
            phase,
            PointerDeviceKind::Mouse,
            0,
            x,
            y,
            seat.pointer_state.buttons(),
            time_ms,
        );
        self.sink.pointer_event(slot, event);
    }

    fn emit_touch(&mut self, phase: PointerPhase, id: i32, x: f64, y: f64, time_ms: u32) {
        let Some(slot) = self.active_slot else {
            return;
        };
        let event =
            PointerEvent::sample(phase, PointerDeviceKind::Touch, id, x, y, 0, time_ms);
        self.sink.pointer_event(slot, event);
    }

    /// Arms (or re-arms) the repeat timer for a seat with its current
    /// rate/delay
    fn arm_repeat(&mut self, seat_index: usize) {
        let (rate, delay_ms) = {
            let seat = &self.seats[seat_index];
            (
                seat.keyboard_state.repeat_rate(),
                seat.keyboard_state.repeat_delay_ms(),
            )
        };
        if rate == 0 {
            return;
        }

        if self.seats[seat_index].repeat_timer.is_none() {
            let queue = Rc::clone(&self.repeat_queue);
            match self.timers.add_timer(Box::new(move || {
                queue.borrow_mut().push_back(seat_index);
            })) {
                Ok(timer) => self.seats[seat_index].repeat_timer = Some(timer),
                Err(e) => {
                    warn!("Could not create the keyboard repeat timer: {}", e);
                    return;
                }
            }
        }

        let interval = Duration::from_millis((1000 / rate.max(1)) as u64);
        let delay = Duration::from_millis(delay_ms as u64);
        if let Some(timer) = &self.seats[seat_index].repeat_timer {
            if let Err(e) = timer.arm(interval, delay) {
                warn!("Could not arm the keyboard repeat timer: {}", e);
            }
        }
    }

    fn disarm_repeat(&mut self, seat_index: usize) {
        if let Some(timer) = &self.seats[seat_index].repeat_timer {
            let _ = timer.disarm();
        }
    }

    /// Re-emits the repeating key for every seat whose timer fired
    pub(super) fn flush_repeats(&mut self) {
        loop {
            let seat_index = {
                let mut queue = self.repeat_queue.borrow_mut();
                let Some(index) = queue.pop_front() else {
                    break;
                };
                index
            };
            let Some(slot) = self.active_slot else {
                continue;
            };
            let Some(seat) = self.seats.get(seat_index) else {
                continue;
            };
            let Some(scancode) = seat.keyboard_state.repeating() else {
                continue;
            };
            let Some(key) = seat.keyboard_state.resolve(scancode) else {
                continue;
            };
            let event = KeyEvent {
                scancode: key.scancode,
                keysym: key.keysym,
                text: key.text,
                pressed: true,
                repeat: true,
                modifiers: seat.keyboard_state.modifiers(),
                timestamp_ms: seat.last_time_ms,
            };
            trace!("Synthetic repeat for scancode {}", scancode);
            self.sink.key_event(slot, event);
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for DisplayState {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.seats.iter_mut().find(|s| s.seat.id() == seat.id()) else {
            return;
        };
        match event {
            wl_seat::Event::Capabilities { capabilities } => {
                let capabilities = match capabilities {
                    WEnum::Value(c) => c,
                    WEnum::Unknown(_) => return,
                };

                let has_pointer = capabilities.contains(wl_seat::Capability::Pointer);
                if has_pointer && entry.pointer.is_none() {
                    entry.pointer = Some(seat.get_pointer(qh, ()));
                    debug!("Seat pointer attached");
                } else if !has_pointer {
                    if let Some(pointer) = entry.pointer.take() {
                        pointer.release();
                    }
                }

                let has_keyboard = capabilities.contains(wl_seat::Capability::Keyboard);
                if has_keyboard && entry.keyboard.is_none() {
                    entry.keyboard = Some(seat.get_keyboard(qh, ()));
                    debug!("Seat keyboard attached");
                } else if !has_keyboard {
                    if let Some(keyboard) = entry.keyboard.take() {
                        keyboard.release();
                    }
                }

                let has_touch = capabilities.contains(wl_seat::Capability::Touch);
                if has_touch && entry.touch.is_none() {
                    entry.touch = Some(seat.get_touch(qh, ()));
                    debug!("Seat touch attached");
                } else if !has_touch {
                    if let Some(touch) = entry.touch.take() {
                        touch.release();
                    }
                }
            }
            wl_seat::Event::Name { name } => debug!("Seat name: {}", name),
            _ => {}
        }
    }
}

impl Dispatch<wl_pointer::WlPointer, ()> for DisplayState {
    fn event(
        state: &mut Self,
        pointer: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(seat_index) = state.seat_index_for_pointer(pointer) else {
            return;
        };
        match event {
            wl_pointer::Event::Enter {
                surface,
                surface_x,
                surface_y,
                ..
            } => {
                state.focus_surface(surface.id());
                let phase = state.seats[seat_index]
                    .pointer_state
                    .enter(surface_x, surface_y);
                let time_ms = state.seats[seat_index].last_time_ms;
                state.emit_pointer(seat_index, phase, time_ms);
            }
            wl_pointer::Event::Leave { .. } => {
                let phase = state.seats[seat_index].pointer_state.leave();
                let time_ms = state.seats[seat_index].last_time_ms;
                state.emit_pointer(seat_index, phase, time_ms);
            }
            wl_pointer::Event::Motion {
                time,
                surface_x,
                surface_y,
            } => {
                state.seats[seat_index].last_time_ms = time;
                let phase = state.seats[seat_index]
                    .pointer_state
                    .motion(surface_x, surface_y);
                state.emit_pointer(seat_index, phase, time);
            }
            wl_pointer::Event::Button {
                time,
                button,
                state: button_state,
                ..
            } => {
                state.seats[seat_index].last_time_ms = time;
                let pressed =
                    matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));
                let phase = state.seats[seat_index]
                    .pointer_state
                    .button(button, pressed);
                state.emit_pointer(seat_index, phase, time);
            }
            wl_pointer::Event::Axis { time, axis, value } => {
                state.seats[seat_index].last_time_ms = time;
                let value = if state.natural_scrolling { -value } else { value };
                match axis {
                    WEnum::Value(wl_pointer::Axis::HorizontalScroll) => {
                        state.seats[seat_index].pending_scroll.0 += value;
                    }
                    WEnum::Value(wl_pointer::Axis::VerticalScroll) => {
                        state.seats[seat_index].pending_scroll.1 += value;
                    }
                    _ => {}
                }
            }
            wl_pointer::Event::Frame => {
                let (dx, dy) = std::mem::take(&mut state.seats[seat_index].pending_scroll);
                if dx != 0.0 || dy != 0.0 {
                    let Some(slot) = state.active_slot else {
                        return;
                    };
                    let phase = state.seats[seat_index].pointer_state.axis();
                    let seat = &state.seats[seat_index];
                    let (x, y) = seat.pointer_state.position();
                    let mut event = PointerEvent::sample(
                        phase,
                        PointerDeviceKind::Mouse,
                        0,
                        x,
                        y,
                        seat.pointer_state.buttons(),
                        seat.last_time_ms,
                    );
                    event.scroll_delta_x = dx;
                    event.scroll_delta_y = dy;
                    state.sink.pointer_event(slot, event);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for DisplayState {
    fn event(
        state: &mut Self,
        keyboard: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(seat_index) = state.seat_index_for_keyboard(keyboard) else {
            return;
        };
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => {
                if !matches!(
                    format,
                    WEnum::Value(wl_keyboard::KeymapFormat::XkbV1)
                ) {
                    warn!("Unsupported keymap format; keyboard stays on old keymap");
                    return;
                }
                let file = File::from(fd);
                let mapping = unsafe {
                    memmap2::MmapOptions::new()
                        .len(size as usize)
                        .map_copy_read_only(&file)
                };
                match mapping {
                    Ok(mapping) => {
                        if let Err(e) =
                            state.seats[seat_index].keyboard_state.load_keymap(&mapping)
                        {
                            warn!("Keymap rejected: {}", e);
                        }
                    }
                    Err(e) => warn!("Could not map the keymap blob: {}", e),
                }
            }
            wl_keyboard::Event::Enter { surface, .. } => {
                state.focus_surface(surface.id());
            }
            wl_keyboard::Event::Leave { .. } => {
                // Focus loss disarms any auto-repeat
                if state.seats[seat_index].keyboard_state.clear_repeat() {
                    state.disarm_repeat(seat_index);
                }
            }
            wl_keyboard::Event::Key {
                time,
                key,
                state: key_state,
                ..
            } => {
                state.seats[seat_index].last_time_ms = time;
                let pressed = matches!(
                    key_state,
                    WEnum::Value(wl_keyboard::KeyState::Pressed)
                );

                let resolved = state.seats[seat_index].keyboard_state.resolve(key);
                let Some(resolved) = resolved else {
                    return; // no keymap yet
                };

                if pressed {
                    if state.seats[seat_index].keyboard_state.press(&resolved) {
                        state.arm_repeat(seat_index);
                    }
                } else if state.seats[seat_index].keyboard_state.release(key) {
                    state.disarm_repeat(seat_index);
                }

                let Some(slot) = state.active_slot else {
                    return;
                };
                let event = KeyEvent {
                    scancode: resolved.scancode,
                    keysym: resolved.keysym,
                    text: resolved.text,
                    pressed,
                    repeat: false,
                    modifiers: state.seats[seat_index].keyboard_state.modifiers(),
                    timestamp_ms: time,
                };
                state.sink.key_event(slot, event);
            }
            wl_keyboard::Event::Modifiers {
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
                ..
            } => {
                state.seats[seat_index].keyboard_state.update_modifiers(
                    mods_depressed,
                    mods_latched,
                    mods_locked,
                    group,
                );
            }
            wl_keyboard::Event::RepeatInfo { rate, delay } => {
                state.seats[seat_index]
                    .keyboard_state
                    .set_repeat_info(rate.max(0) as u32, delay.max(0) as u32);
                // A live repeat keeps its old cadence until the next press
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_touch::WlTouch, ()> for DisplayState {
    fn event(
        state: &mut Self,
        touch: &wl_touch::WlTouch,
        event: wl_touch::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(seat_index) = state.seat_index_for_touch(touch) else {
            return;
        };
        match event {
            wl_touch::Event::Down {
                time,
                surface,
                id,
                x,
                y,
                ..
            } => {
                state.focus_surface(surface.id());
                state.seats[seat_index].last_time_ms = time;
                let phase = state.seats[seat_index].touch_tracker.down(id, x, y);
                state.emit_touch(phase, id, x, y, time);
            }
            wl_touch::Event::Up { time, id, .. } => {
                state.seats[seat_index].last_time_ms = time;
                if let Some((phase, x, y)) = state.seats[seat_index].touch_tracker.up(id) {
                    state.emit_touch(phase, id, x, y, time);
                }
            }
            wl_touch::Event::Motion { time, id, x, y } => {
                state.seats[seat_index].last_time_ms = time;
                if let Some(phase) = state.seats[seat_index].touch_tracker.motion(id, x, y) {
                    state.emit_touch(phase, id, x, y, time);
                }
            }
            wl_touch::Event::Cancel => {
                let lifted = state.seats[seat_index].touch_tracker.cancel();
                let time_ms = state.seats[seat_index].last_time_ms;
                for (id, x, y) in lifted {
                    state.emit_touch(PointerPhase::Up, id, x, y, time_ms);
                }
            }
            _ => {}
        }
    }
}
