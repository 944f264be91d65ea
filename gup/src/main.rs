// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

/// Main entry point
fn main() {
    std::process::exit(gup::cli::run())
}
