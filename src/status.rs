/*
 * This file is part of Titon Controller.
 *
 * Copyright (C) 2025 Titon Controller contributors
 *
 * Titon Controller is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Titon Controller is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Titon Controller. If not, see <https://www.gnu.org/licenses/>.
 */

//! Decoding of the 16-bit status word read from register 061.

/// Label returned when no status bit is set.
pub const NO_ERRORS: &str = "No errors reported";

/// Bit position table for the status word, least significant bit first.
pub const STATUS_FLAGS: [(u16, &str); 16] = [
    (1 << 0, "Supply fan error"),
    (1 << 1, "Thermistor error"),
    (1 << 2, "Extract fan error"),
    (1 << 3, "EEPROM error"),
    (1 << 4, "Switch 1 active"),
    (1 << 5, "Switch 2 active"),
    (1 << 6, "Switch 3 active"),
    (1 << 7, "Limit switch 1 active"),
    (1 << 8, "Limit switch 2 active"),
    (1 << 9, "Engine error"),
    (1 << 10, "Switch error"),
    (1 << 11, "Engine running"),
    (1 << 12, "Thermistor 1 error"),
    (1 << 13, "Thermistor 2 error"),
    (1 << 14, "Thermistor 3 error"),
    (1 << 15, "Humidity sensor error"),
];

/// Labels for every set bit, or `[NO_ERRORS]` when the word is zero.
pub fn decode_status_word(word: u16) -> Vec<&'static str> {
    let flags: Vec<&'static str> = STATUS_FLAGS
        .iter()
        .filter(|(bit, _)| word & bit != 0)
        .map(|(_, label)| *label)
        .collect();
    if flags.is_empty() {
        vec![NO_ERRORS]
    } else {
        flags
    }
}
