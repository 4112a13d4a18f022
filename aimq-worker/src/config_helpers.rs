use aimq_config::Config;
use aimq_queue::{ConnectionSettings, QueueService, QueueSettings};

/// Build queue defaults from application config.
pub fn queue_settings_from_config(cfg: &Config) -> QueueSettings {
    QueueSettings {
        prefix: cfg.queue.prefix.clone(),
        default_attempts: cfg.queue.default_attempts,
        default_concurrency: cfg.queue.default_concurrency,
        backoff_delay_ms: cfg.queue.backoff_delay_ms,
    }
}

/// Build Redis connection settings from application config.
pub fn connection_settings_from_config(cfg: &Config) -> ConnectionSettings {
    ConnectionSettings {
        url: cfg.redis.url.clone(),
        host: cfg.redis.host.clone(),
        port: cfg.redis.port,
        db: cfg.redis.db,
        username: cfg.redis.username.clone(),
        password: cfg.redis.password.clone(),
        tls: cfg.redis.tls,
        ..ConnectionSettings::default()
    }
}

/// Build the queue service, on Redis unless `memory` is set.
pub fn queue_service_from_config(cfg: &Config, memory: bool) -> QueueService {
    let settings = queue_settings_from_config(cfg);
    if memory {
        QueueService::in_memory(settings)
    } else {
        QueueService::connect(settings, connection_settings_from_config(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_queue_defaults() {
        let mut cfg = Config::default();
        cfg.queue.prefix = "staging".into();
        cfg.queue.default_attempts = 3;
        let settings = queue_settings_from_config(&cfg);
        assert_eq!(settings.prefix, "staging");
        assert_eq!(settings.default_attempts, 3);
        assert_eq!(settings.default_concurrency, 5);
        assert_eq!(settings.backoff_delay_ms, 5000);
    }

    #[test]
    fn maps_redis_settings() {
        let mut cfg = Config::default();
        cfg.redis.host = "cache.internal".into();
        cfg.redis.password = Some("secret".into());
        cfg.redis.tls = true;
        let conn = connection_settings_from_config(&cfg);
        assert_eq!(
            conn.redis_url().unwrap(),
            "rediss://:secret@cache.internal:6379/0"
        );
    }

    #[tokio::test]
    async fn memory_flag_selects_in_process_backend() {
        let service = queue_service_from_config(&Config::default(), true);
        assert_eq!(
            service.connection_state(),
            aimq_queue::ConnectionState::Connected
        );
        assert_eq!(service.settings().prefix, "ai-marketing");
    }
}
