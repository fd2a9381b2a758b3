/*! Integration tests for Keyfleet.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - registry: Loading and validating user lists from files
 * - keystore: Key Store backends, persistence and concurrent creation
 * - instance: Inventory sources and instance resolution
 * - installer: Convergence of single pairs against a simulated fleet
 * - coordinator: Whole runs, reruns, partial failures and notifications
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("keyfleet=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod coordinator;
mod helpers;
mod installer;
mod instance;
mod keystore;
mod registry;
