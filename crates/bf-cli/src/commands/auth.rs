use std::path::Path;

use anyhow::Context;

pub fn folder(dir: &Path) -> anyhow::Result<()> {
    let bundle = buildfarm_auth::generate_bundle()?;
    let written = buildfarm_auth::write_folder(&bundle, dir)
        .with_context(|| format!("writing credentials to {}", dir.display()))?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
