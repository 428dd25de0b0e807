// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

/// Lookup key for a device or link name: lowercase, letters and digits only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Delta-Castle"), "deltacastle");
        assert_eq!(normalize_name("TEL P-12"), "telp12");
        assert_eq!(normalize_name("sim_handler"), "simhandler");
    }
}
