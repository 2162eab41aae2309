use std::path::{Path, PathBuf};

use rbulk::manifest::{
    core::Manifest,
    yaml::{read_manifest, YAML_CONFIG_NAME},
};

use crate::console::print_error_message;

pub fn rbulk_yaml_path(project_path: &Path) -> PathBuf {
    project_path.join(YAML_CONFIG_NAME)
}

pub fn load_rbulk_yaml(project_path: &Path) -> Result<Manifest, String> {
    let path = rbulk_yaml_path(project_path);
    if !path.exists() {
        let error = format!("{} does not exist in {}", YAML_CONFIG_NAME, project_path.display());
        print_error_message(&error);
        return Err(error);
    }

    read_manifest(&path).map_err(|e| {
        let error = format!("Could not read the {}: trace: {}", YAML_CONFIG_NAME, e);
        print_error_message(&error);
        error
    })
}
