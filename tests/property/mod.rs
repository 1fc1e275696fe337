mod backoff_props;
mod cache_props;
mod cron_props;
