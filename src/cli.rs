//! Command line parsing for the `vfsattrs` binary.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLineConfig {
    pub backend: Option<String>,
    pub database: Option<String>,
    pub config_path: Option<String>,
    pub command: String,
    pub command_args: Vec<String>,
}

impl CommandLineConfig {
    pub fn from_args(args: &[&str]) -> Result<Self, String> {
        let mut backend = None;
        let mut database = None;
        let mut config_path = None;
        let mut command = String::from("stats");
        let mut command_args = Vec::new();
        let mut command_set = false;

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            if command_set {
                command_args.push(arg.to_string());
                continue;
            }
            match *arg {
                "--backend" => {
                    backend = Some(
                        iter.next()
                            .ok_or_else(|| "--backend requires a value".to_string())?
                            .to_string(),
                    );
                }
                "--db" | "--database" => {
                    database = Some(
                        iter.next()
                            .ok_or_else(|| "--db requires a value".to_string())?
                            .to_string(),
                    );
                }
                "--config" => {
                    config_path = Some(
                        iter.next()
                            .ok_or_else(|| "--config requires a value".to_string())?
                            .to_string(),
                    );
                }
                other if other.starts_with('-') => {
                    return Err(format!("unknown flag {other}"));
                }
                _ => {
                    command = arg.to_string();
                    command_set = true;
                }
            }
        }

        Ok(Self {
            backend,
            database,
            config_path,
            command,
            command_args,
        })
    }

    pub fn help() -> &'static str {
        r#"Usage: vfsattrs [--config PATH] [--backend page-cache|mmap] --db PATH [COMMAND]

Commands:
  stats                          Print storage statistics as JSON (default)
  dump                           Print every attribute as one JSON line
  check                          Validate all attribute records
  put FILE_ID ATTR_ID VALUE      Store VALUE (UTF-8) as an attribute
  get FILE_ID ATTR_ID            Print an attribute value
  delete FILE_ID ATTR_ID         Delete an attribute
  delete-file FILE_ID            Delete all attributes of a file

Options:
  --config PATH                  JSON storage configuration
  --backend page-cache|mmap      Override the configured backend
  --db PATH                      Storage file

Environment:
  VFSATTRS_LOG                   Log filter (e.g. debug, vfsattrs=trace)

Examples:
  vfsattrs --db attrs.blobs put 17 3 hello
  vfsattrs --db attrs.blobs get 17 3
  vfsattrs --backend mmap --db attrs.blobs check
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_stats() {
        let config = CommandLineConfig::from_args(&["vfsattrs", "--db", "a.blobs"]).unwrap();
        assert_eq!(config.command, "stats");
        assert_eq!(config.database.as_deref(), Some("a.blobs"));
        assert!(config.backend.is_none());
    }

    #[test]
    fn test_command_args_are_collected() {
        let config = CommandLineConfig::from_args(&[
            "vfsattrs", "--backend", "mmap", "--db", "a.blobs", "put", "1", "2", "--value-like",
        ])
        .unwrap();
        assert_eq!(config.command, "put");
        assert_eq!(config.command_args, vec!["1", "2", "--value-like"]);
        assert_eq!(config.backend.as_deref(), Some("mmap"));
    }

    #[test]
    fn test_flag_errors() {
        assert!(CommandLineConfig::from_args(&["vfsattrs", "--db"]).is_err());
        assert!(CommandLineConfig::from_args(&["vfsattrs", "--verbose"]).is_err());
    }
}
