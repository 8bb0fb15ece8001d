//! Environment variable assembly and command templating

use std::collections::BTreeMap;
use std::path::Path;

use secrecy::ExposeSecret;

use crate::secrets::SecretMap;

/// Variables injected into hooks and supervised processes
pub type EnvMap = BTreeMap<String, String>;

/// Executables that must come from the environment's runtime
pub const RUNTIME_EXECUTABLES: [&str; 5] = ["python", "gunicorn", "celery", "django-admin", "uwsgi"];

const SECRET_PREFIX: &str = "SECRET_";
const INTERNAL_PREFIX: char = '_';

/// Build the variable set for a deployment.
///
/// Precedence, lowest first: system values, config `env_vars` (a value that
/// is exactly `${SECRET_<NAME>}` is replaced by secret `NAME` when it
/// exists), then the secrets themselves. Secrets whose key starts with `_`
/// are internal and never injected.
pub fn assemble(
    project: &str,
    environment: &str,
    version: &str,
    config_vars: &BTreeMap<String, String>,
    secrets: &SecretMap,
) -> EnvMap {
    let mut env = EnvMap::new();
    env.insert("DEPLOYMENT_VERSION".to_string(), version.to_string());
    env.insert("DEPLOYMENT_ENV".to_string(), environment.to_string());
    env.insert("PROJECT_NAME".to_string(), project.to_string());

    for (key, value) in config_vars {
        let resolved = secret_reference(value)
            .and_then(|name| secrets.get(name))
            .map(|secret| secret.expose_secret().to_string())
            .unwrap_or_else(|| value.clone());
        env.insert(key.clone(), resolved);
    }

    for (key, value) in secrets {
        if key.starts_with(INTERNAL_PREFIX) {
            continue;
        }
        env.insert(key.clone(), value.expose_secret().to_string());
    }

    env
}

/// `NAME` of a `${SECRET_NAME}` value
fn secret_reference(value: &str) -> Option<&str> {
    value
        .trim()
        .strip_prefix("${")?
        .strip_suffix('}')?
        .strip_prefix(SECRET_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Queue name shared by the workers of one environment
pub fn queue_name(project: &str, environment: &str) -> String {
    format!("{}-{}", project, environment)
}

/// Values substituted into service commands and hooks
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    pub project: &'a str,
    pub environment: &'a str,
    /// `${PORT}` is left untouched when unknown
    pub port: Option<u16>,
}

impl Placeholders<'_> {
    pub fn apply(&self, template: &str) -> String {
        let mut out = template
            .replace("${QUEUE_NAME}", &queue_name(self.project, self.environment))
            .replace("${PROJECT_NAME}", self.project)
            .replace("${ENVIRONMENT}", self.environment);
        if let Some(port) = self.port {
            out = out.replace("${PORT}", &port.to_string());
        }
        out
    }
}

/// Point interpreter-bound executables at the runtime's `bin` directory.
///
/// Only words in command position are rewritten: the first word and the
/// first word after `&&`, `||`, `;` or `|`. Arguments that merely look like
/// an executable name (`-Q celery`) are left alone.
pub fn rewrite_executables(command: &str, bin_dir: &Path) -> String {
    let mut command_position = true;
    let words: Vec<String> = command
        .split(' ')
        .map(|word| {
            if word.is_empty() {
                return String::new();
            }
            let rewritten = if command_position && RUNTIME_EXECUTABLES.contains(&word) {
                bin_dir.join(word).display().to_string()
            } else {
                word.to_string()
            };
            command_position = matches!(word, "&&" | "||" | ";" | "|");
            rewritten
        })
        .collect();
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn secrets(pairs: &[(&str, &str)]) -> SecretMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SecretString::from(v.to_string())))
            .collect()
    }

    #[test]
    fn test_precedence() {
        let mut config = BTreeMap::new();
        config.insert("PROJECT_NAME".to_string(), "override".to_string());
        config.insert("DATABASE_URL".to_string(), "${SECRET_DB}".to_string());
        config.insert("MISSING".to_string(), "${SECRET_NOPE}".to_string());
        config.insert("API_KEY".to_string(), "from-config".to_string());

        let env = assemble(
            "shop",
            "qa",
            "20240101-000000",
            &config,
            &secrets(&[("DB", "postgres://db"), ("API_KEY", "from-secret"), ("_internal", "x")]),
        );

        assert_eq!(env["DEPLOYMENT_VERSION"], "20240101-000000");
        assert_eq!(env["DEPLOYMENT_ENV"], "qa");
        assert_eq!(env["PROJECT_NAME"], "override");
        assert_eq!(env["DATABASE_URL"], "postgres://db");
        assert_eq!(env["MISSING"], "${SECRET_NOPE}");
        assert_eq!(env["API_KEY"], "from-secret");
        assert_eq!(env["DB"], "postgres://db");
        assert!(!env.contains_key("_internal"));
    }

    #[test]
    fn test_placeholders() {
        let with_port = Placeholders {
            project: "shop",
            environment: "prod",
            port: Some(8002),
        };
        assert_eq!(
            with_port.apply("gunicorn -b 127.0.0.1:${PORT} -n ${PROJECT_NAME}-${ENVIRONMENT}"),
            "gunicorn -b 127.0.0.1:8002 -n shop-prod"
        );

        let without_port = Placeholders { port: None, ..with_port };
        assert_eq!(
            without_port.apply("celery worker -Q ${QUEUE_NAME} --port ${PORT}"),
            "celery worker -Q shop-prod --port ${PORT}"
        );
    }

    #[test]
    fn test_rewrite_command_position_only() {
        let bin = Path::new("/apps/shop/envs/qa/bin");
        assert_eq!(
            rewrite_executables("python manage.py migrate && celery -A shop -Q celery", bin),
            "/apps/shop/envs/qa/bin/python manage.py migrate && /apps/shop/envs/qa/bin/celery -A shop -Q celery"
        );
        assert_eq!(
            rewrite_executables("cd src && gunicorn  app.wsgi", bin),
            "cd src && /apps/shop/envs/qa/bin/gunicorn  app.wsgi"
        );
        assert_eq!(rewrite_executables("python3 -V", bin), "python3 -V");
    }
}
