//! Deterministic environment-string layering applied before `exec`.

use std::collections::BTreeMap;

use crate::config::SiteEnvLayers;
use crate::image_metadata::ImageMetadata;

fn upsert(vars: &mut Vec<(String, String)>, name: &str, value: String) {
    if let Some(slot) = vars.iter_mut().find(|(n, _)| n == name) {
        slot.1 = value;
    } else {
        vars.push((name.to_string(), value));
    }
}

fn split_pair(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=')
}

/// Layer `current_env` (the invoker's process environment, `NAME=VALUE`
/// pairs) under the image's declared env, then the site's set/append/
/// prepend/unset layers, in that order.
pub fn compose(
    current_env: &[(String, String)],
    image: &ImageMetadata,
    site_env: &SiteEnvLayers,
) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = current_env.to_vec();

    for entry in &image.env {
        if let Some((name, value)) = split_pair(entry) {
            upsert(&mut vars, name, value.to_string());
        }
    }
    for entry in &site_env.set {
        if let Some((name, value)) = split_pair(entry) {
            upsert(&mut vars, name, value.to_string());
        }
    }
    for entry in &site_env.append {
        if let Some((name, value)) = split_pair(entry) {
            match vars.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = format!("{}:{value}", slot.1),
                None => vars.push((name.to_string(), value.to_string())),
            }
        }
    }
    for entry in &site_env.prepend {
        if let Some((name, value)) = split_pair(entry) {
            match vars.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = format!("{value}:{}", slot.1),
                None => vars.push((name.to_string(), value.to_string())),
            }
        }
    }
    for name in &site_env.unset {
        vars.retain(|(n, _)| n != name);
    }

    vars
}

/// After chroot, overwrite `PATH` in `vars` with the container-relative
/// value so subsequently exec'd helpers resolve against the container, not
/// the host environment that was captured before chroot.
pub fn propagate_container_path(vars: &mut Vec<(String, String)>, container_path: &str) {
    upsert(vars, "PATH", container_path.to_string());
}

/// Convenience view for callers that want a name -> value map rather than
/// an order-preserving list.
pub fn as_map(vars: &[(String, String)]) -> BTreeMap<String, String> {
    vars.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_metadata::ImageFormat;

    fn image(env: &[&str]) -> ImageMetadata {
        ImageMetadata {
            identifier: "x".to_string(),
            filename: "/x".into(),
            format: ImageFormat::Vfs,
            env: env.iter().map(|s| s.to_string()).collect(),
            entrypoint: None,
            workdir: None,
            volume: Vec::new(),
        }
    }

    #[test]
    fn image_env_replaces_current() {
        let current = vec![("PATH".to_string(), "/usr/bin".to_string())];
        let img = image(&["PATH=/opt/bin"]);
        let site = SiteEnvLayers::default();
        let out = compose(&current, &img, &site);
        assert_eq!(as_map(&out)["PATH"], "/opt/bin");
    }

    #[test]
    fn site_append_and_prepend_order() {
        let current = vec![("PATH".to_string(), "/usr/bin".to_string())];
        let img = image(&[]);
        let site = SiteEnvLayers {
            set: Vec::new(),
            append: vec!["PATH=/after".to_string()],
            prepend: vec!["PATH=/before".to_string()],
            unset: Vec::new(),
        };
        let out = compose(&current, &img, &site);
        assert_eq!(as_map(&out)["PATH"], "/before:/usr/bin:/after");
    }

    #[test]
    fn site_unset_removes() {
        let current = vec![("FOO".to_string(), "bar".to_string())];
        let img = image(&[]);
        let site = SiteEnvLayers {
            unset: vec!["FOO".to_string()],
            ..Default::default()
        };
        let out = compose(&current, &img, &site);
        assert!(as_map(&out).get("FOO").is_none());
    }

    #[test]
    fn container_path_propagation_overwrites() {
        let mut vars = vec![("PATH".to_string(), "/old".to_string())];
        propagate_container_path(&mut vars, "/usr/local/bin:/usr/bin");
        assert_eq!(as_map(&vars)["PATH"], "/usr/local/bin:/usr/bin");
    }
}
