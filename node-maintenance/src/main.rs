// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use clap::Parser;
use node_maintenance::NodeMaintenanceApp;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let app = NodeMaintenanceApp::parse();
    let config = app.load_config()?;
    let (log, _guard) = NodeMaintenanceApp::setup_log(&config.log)?;
    app.exec(&log, &config).await
}
