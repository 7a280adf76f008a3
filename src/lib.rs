// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

pub mod config;
pub mod instance;
pub mod runner;
pub mod scenarios;

use std::error::Error;

fn error_sources(top_error: &dyn Error) -> impl Iterator<Item = &dyn Error> {
    std::iter::successors(Some(top_error), |sub_error| {
        // Dereference necessary to mitigate rustc compiler bug.
        // See <https://github.com/rust-lang/rust/issues/141673>
        (*sub_error).source()
    })
}

/// Flattens an error and its sources into a single line.
pub fn error_chain(top_error: &dyn Error) -> String {
    error_sources(top_error)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} exited with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        error_sources(top_error)
            .enumerate()
            .for_each(|(level, error)| {
                eprintln!("  {level}: {error}",);
            });
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}
