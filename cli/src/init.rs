use std::path::Path;

use anyhow::{bail, Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use tanjun_common::config::CONFIG_FILE;
use tanjun_common::project::ProjectName;

/// Interactive form writing a fresh `.tanjun.yml` next to the sources.
pub fn init(directory: &Path) -> Result<()> {
    let config_path = directory.join(CONFIG_FILE);

    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let theme = ColorfulTheme::default();

    let default_name = directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name: String = Input::with_theme(&theme)
        .with_prompt("Project name")
        .default(default_name)
        .validate_with(|input: &String| {
            ProjectName::from_human(input).map(|_| ()).map_err(|err| err.to_string())
        })
        .interact_text()?;

    let image: String = Input::with_theme(&theme)
        .with_prompt("Image repository (for example ghcr.io/you/app)")
        .interact_text()?;

    let address: String = Input::with_theme(&theme)
        .with_prompt("Server address")
        .interact_text()?;

    let username: String = Input::with_theme(&theme)
        .with_prompt("SSH username")
        .default("root".to_string())
        .interact_text()?;

    let host: String = Input::with_theme(&theme)
        .with_prompt("Public hostname the app serves")
        .interact_text()?;

    let remote_build = Confirm::with_theme(&theme)
        .with_prompt("Build on the server instead of locally?")
        .default(false)
        .interact()?;

    let config = serde_yaml::to_string(&serde_yaml::Value::from(serde_yaml::Mapping::from_iter(
        [
            ("name".into(), name.into()),
            ("image".into(), image.into()),
            (
                "server".into(),
                serde_yaml::Value::from(serde_yaml::Mapping::from_iter([
                    ("address".into(), address.into()),
                    ("username".into(), username.into()),
                ])),
            ),
            (
                "proxy".into(),
                serde_yaml::Value::from(serde_yaml::Mapping::from_iter([(
                    "host".into(),
                    host.into(),
                )])),
            ),
            (
                "build".into(),
                serde_yaml::Value::from(serde_yaml::Mapping::from_iter([(
                    "remote_build".into(),
                    remote_build.into(),
                )])),
            ),
        ],
    )))?;

    std::fs::write(&config_path, config)
        .with_context(|| format!("writing {}", config_path.display()))?;

    println!("Wrote {}. Run `tanjun setup` once, then `tanjun deploy`.", config_path.display());

    Ok(())
}
