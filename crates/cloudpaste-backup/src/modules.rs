//! Backup module → table mapping and the table dependency DAG.

/// Every exportable table, in a valid parent-before-child insert order.
pub const ALL_TABLES: &[&str] = &[
    "admins",
    "admin_tokens",
    "api_keys",
    "storage_configs",
    "principal_storage_acl",
    "storage_mounts",
    "fs_meta",
    "pastes",
    "paste_passwords",
    "files",
    "file_passwords",
    "system_settings",
];

pub const ALL_MODULES: &[&str] = &[
    "paste_management",
    "file_management",
    "mount_management",
    "storage_config",
    "account_management",
    "fs_meta",
    "system_settings",
];

pub fn module_tables(module: &str) -> Option<&'static [&'static str]> {
    Some(match module {
        "paste_management" => &["pastes", "paste_passwords"],
        "file_management" => &["files", "file_passwords"],
        "mount_management" => &["storage_mounts"],
        "storage_config" => &["storage_configs", "principal_storage_acl"],
        "account_management" => &["admins", "admin_tokens", "api_keys"],
        "fs_meta" => &["fs_meta"],
        "system_settings" => &["system_settings"],
        _ => return None,
    })
}

/// Modules a selection transitively pulls in: mounts and file shares both
/// reference storage configs.
fn module_dependencies(module: &str) -> &'static [&'static str] {
    match module {
        "mount_management" | "file_management" => &["storage_config"],
        _ => &[],
    }
}

/// Expand a module selection with its transitive dependencies. Returns
/// `(included_modules, auto_included_dependencies)`.
pub fn expand_modules(selected: &[String]) -> (Vec<String>, Vec<String>) {
    let mut included: Vec<String> = Vec::new();
    let mut auto_added: Vec<String> = Vec::new();
    let mut queue: Vec<(String, bool)> =
        selected.iter().map(|m| (m.clone(), false)).collect();

    while let Some((module, was_dependency)) = queue.pop() {
        if included.iter().any(|m| *m == module) {
            continue;
        }
        included.push(module.clone());
        if was_dependency && !selected.contains(&module) {
            auto_added.push(module.clone());
        }
        for dep in module_dependencies(&module) {
            queue.push(((*dep).to_string(), true));
        }
    }

    included.sort();
    auto_added.sort();
    (included, auto_added)
}

/// Child → parent FK edges driving restore ordering and integrity checks.
pub const TABLE_DEPS: &[(&str, &str)] = &[
    ("admin_tokens", "admins"),
    ("storage_configs", "admins"),
    ("principal_storage_acl", "api_keys"),
    ("principal_storage_acl", "storage_configs"),
    ("storage_mounts", "storage_configs"),
    ("files", "storage_configs"),
    ("paste_passwords", "pastes"),
    ("file_passwords", "files"),
];

/// Order `tables` so every parent precedes its children (Kahn's algorithm,
/// stable on the incoming order). If a cycle sneaks in, the remaining
/// tables are appended as-is.
pub fn dependency_order(tables: &[String]) -> Vec<String> {
    let mut ordered = Vec::with_capacity(tables.len());
    let mut remaining: Vec<String> = tables.to_vec();

    while !remaining.is_empty() {
        let next = remaining.iter().position(|table| {
            !TABLE_DEPS.iter().any(|(child, parent)| {
                child == table && remaining.iter().any(|t| t == parent) && parent != table
            })
        });
        match next {
            Some(idx) => ordered.push(remaining.remove(idx)),
            None => {
                ordered.append(&mut remaining);
                break;
            }
        }
    }

    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_pulls_storage_config_for_mounts() {
        let (included, auto) = expand_modules(&["mount_management".to_string()]);
        assert_eq!(included, vec!["mount_management", "storage_config"]);
        assert_eq!(auto, vec!["storage_config"]);

        // Explicitly selected dependencies are not reported as auto-added.
        let (_, auto) = expand_modules(&[
            "mount_management".to_string(),
            "storage_config".to_string(),
        ]);
        assert!(auto.is_empty());
    }

    #[test]
    fn dependency_order_puts_parents_first() {
        let tables: Vec<String> = [
            "file_passwords",
            "storage_mounts",
            "files",
            "storage_configs",
            "admins",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let ordered = dependency_order(&tables);
        let pos = |t: &str| ordered.iter().position(|x| x == t).unwrap();
        assert!(pos("admins") < pos("storage_configs"));
        assert!(pos("storage_configs") < pos("storage_mounts"));
        assert!(pos("storage_configs") < pos("files"));
        assert!(pos("files") < pos("file_passwords"));
    }

    #[test]
    fn every_module_table_is_known() {
        for module in ALL_MODULES {
            for table in module_tables(module).unwrap() {
                assert!(ALL_TABLES.contains(table), "{table} missing from ALL_TABLES");
            }
        }
    }
}
