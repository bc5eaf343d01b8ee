// State differencing: compares successive snapshots and turns every
// change into a notification, tracking the worst severity per pool so
// the pool's status dump can be attached at the right level.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::config::SeverityConfig;
use crate::leds::LedIndicator;
use crate::models::{Dev, Pool, PoolUsage};
use crate::notifier::{Notifier, Severity};

/// Keep the numerically lowest (most urgent) severity seen per pool.
fn track(notified: &mut HashMap<String, Severity>, name: &str, severity: Severity) {
    notified
        .entry(name.to_string())
        .and_modify(|s| {
            if severity < *s {
                *s = severity;
            }
        })
        .or_insert(severity);
}

fn state_severity(map: &HashMap<String, Severity>, state: &str) -> Severity {
    map.get(state).copied().unwrap_or(Severity::Info)
}

/// Compares two status snapshots and notifies about every difference:
/// removed pools, added pools (one message, no device detail), and for
/// pools on both sides the per-device changes first, then the pool-wide
/// status/errors/state fields. Finishes by attaching each notified
/// pool's verbatim status text at the worst severity recorded for it.
///
/// Returns the LED indicator updates implied by device state changes;
/// the caller applies them when LED control is enabled.
pub async fn compare_pool_status(
    notify: &Notifier,
    severity: &SeverityConfig,
    led_state_map: &HashMap<String, LedIndicator>,
    old: &[Pool],
    new: &[Pool],
) -> Result<HashMap<String, LedIndicator>> {
    let mut notified: HashMap<String, Severity> = HashMap::new();
    let mut leds_to_set: HashMap<String, LedIndicator> = HashMap::new();

    let old_pools: HashMap<&str, &Pool> = old.iter().map(|p| (p.name.as_str(), p)).collect();
    let new_pools: HashMap<&str, &Pool> = new.iter().map(|p| (p.name.as_str(), p)).collect();

    for pool in old {
        if !new_pools.contains_key(pool.name.as_str()) {
            notify
                .send(severity.pool_removed, format!(r#"pool "{}" removed"#, pool.name))
                .await?;
        }
    }

    for pool in new {
        let Some(old_pool) = old_pools.get(pool.name.as_str()).copied() else {
            notify
                .send(severity.pool_added, format!(r#"pool "{}" added"#, pool.name))
                .await?;
            track(&mut notified, &pool.name, severity.pool_added);
            // a new pool gets one message; its devices are not compared
            continue;
        };

        let old_devs: HashMap<&str, &Dev> =
            old_pool.devs.iter().map(|d| (d.name.as_str(), d)).collect();
        let new_devs: HashMap<&str, &Dev> = pool.devs.iter().map(|d| (d.name.as_str(), d)).collect();

        for dev in &old_pool.devs {
            if dev.is_container() {
                continue;
            }
            if !new_devs.contains_key(dev.name.as_str()) {
                notify
                    .send(
                        severity.dev_removed,
                        format!(r#"pool "{}" device "{}" removed"#, pool.name, dev.name),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.dev_removed);
            }
        }

        for dev in &pool.devs {
            if dev.is_container() {
                continue;
            }
            let Some(old_dev) = old_devs.get(dev.name.as_str()).copied() else {
                notify
                    .send(
                        severity.dev_added,
                        format!(r#"pool "{}" device "{}" added"#, pool.name, dev.name),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.dev_added);
                continue;
            };

            // counters only fire on strict increase; a pool clear may
            // legitimately reset them to zero
            if dev.read > old_dev.read {
                notify
                    .send(
                        severity.dev_read_errors_increased,
                        format!(
                            r#"pool "{}" device "{}" read errors increased: {} -> {}"#,
                            pool.name, dev.name, old_dev.read, dev.read
                        ),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.dev_read_errors_increased);
            }
            if dev.write > old_dev.write {
                notify
                    .send(
                        severity.dev_write_errors_increased,
                        format!(
                            r#"pool "{}" device "{}" write errors increased: {} -> {}"#,
                            pool.name, dev.name, old_dev.write, dev.write
                        ),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.dev_write_errors_increased);
            }
            if dev.cksum > old_dev.cksum {
                notify
                    .send(
                        severity.dev_cksum_errors_increased,
                        format!(
                            r#"pool "{}" device "{}" cksum errors increased: {} -> {}"#,
                            pool.name, dev.name, old_dev.cksum, dev.cksum
                        ),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.dev_cksum_errors_increased);
            }
            if dev.state != old_dev.state {
                let sev = state_severity(&severity.dev_state_map, &dev.state);
                notify
                    .send(
                        sev,
                        format!(
                            r#"pool "{}" device "{}" state changed: {} -> {}"#,
                            pool.name, dev.name, old_dev.state, dev.state
                        ),
                    )
                    .await?;
                track(&mut notified, &pool.name, sev);
                leds_to_set.insert(
                    dev.name.clone(),
                    led_state_map.get(&dev.state).copied().unwrap_or(LedIndicator::Normal),
                );
            }
            if dev.rest != old_dev.rest {
                if !dev.rest.is_empty() {
                    notify
                        .send(
                            severity.dev_additional_info_changed,
                            format!(
                                r#"pool "{}" device "{}" new additional info: {}"#,
                                pool.name, dev.name, dev.rest
                            ),
                        )
                        .await?;
                    track(&mut notified, &pool.name, severity.dev_additional_info_changed);
                } else {
                    notify
                        .send(
                            severity.dev_additional_info_cleared,
                            format!(
                                r#"pool "{}" device "{}" additional info cleared"#,
                                pool.name, dev.name
                            ),
                        )
                        .await?;
                    track(&mut notified, &pool.name, severity.dev_additional_info_cleared);
                }
            }
        }

        if pool.status != old_pool.status {
            if !pool.status.is_empty() {
                notify
                    .send(
                        severity.pool_status_changed,
                        format!(r#"pool "{}" new status: {}"#, pool.name, pool.status),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.pool_status_changed);
            } else {
                notify
                    .send(
                        severity.pool_status_cleared,
                        format!(r#"pool "{}" status cleared"#, pool.name),
                    )
                    .await?;
                track(&mut notified, &pool.name, severity.pool_status_cleared);
            }
        }
        if pool.errors != old_pool.errors {
            notify
                .send(
                    severity.pool_errors_changed,
                    format!(r#"pool "{}" new errors: {}"#, pool.name, pool.errors),
                )
                .await?;
            track(&mut notified, &pool.name, severity.pool_errors_changed);
        }
        if pool.state != old_pool.state {
            let sev = state_severity(&severity.pool_state_map, &pool.state);
            notify
                .send(
                    sev,
                    format!(
                        r#"pool "{}" state changed: {} -> {}"#,
                        pool.name, old_pool.state, pool.state
                    ),
                )
                .await?;
            track(&mut notified, &pool.name, sev);
        }
    }

    // one status dump per notified pool, at the worst severity seen
    for pool in new {
        if let Some(&sev) = notified.get(&pool.name) {
            notify.attach(sev, pool.raw_text.clone()).await?;
        }
    }

    Ok(leds_to_set)
}

/// Reports pools whose usage percentage crossed a configured threshold
/// upwards: the highest threshold in `(oldPct, newPct]` wins.
pub async fn compare_pool_usage(
    notify: &Notifier,
    used_space: &BTreeMap<u8, Severity>,
    old: &BTreeMap<String, PoolUsage>,
    new: &BTreeMap<String, PoolUsage>,
) -> Result<()> {
    if used_space.is_empty() {
        return Ok(());
    }
    for (name, old_usage) in old {
        let Some(new_usage) = new.get(name) else {
            continue;
        };
        let old_pct = old_usage.used_percent();
        let new_pct = new_usage.used_percent();
        if new_pct <= old_pct {
            continue;
        }
        let crossed = used_space
            .iter()
            .rev()
            .find(|&(&level, _)| old_pct < i64::from(level) && new_pct >= i64::from(level));
        if let Some((&level, &sev)) = crossed {
            notify
                .send(sev, format!(r#"pool "{name}" usage reached {level}%"#))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MsgKind;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<(MsgKind, Severity, String)>>>;

    fn capture_notifier() -> (Notifier, Captured) {
        let mut notify = Notifier::new();
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        notify
            .add_callback(
                Severity::Debug,
                Box::new(move |m| {
                    sink.lock().unwrap().push((m.kind, m.severity, m.text.clone()));
                }),
            )
            .unwrap();
        (notify, captured)
    }

    fn leaf(name: &str, state: &str, read: i64, write: i64, cksum: i64) -> Dev {
        Dev {
            name: name.into(),
            state: state.into(),
            read,
            write,
            cksum,
            rest: String::new(),
            sub_devs: vec![],
            parent_dev: Some(0),
        }
    }

    fn pool(name: &str, state: &str, devs: Vec<Dev>) -> Pool {
        Pool {
            name: name.into(),
            state: state.into(),
            raw_text: format!("  pool: {name}\n state: {state}\n"),
            devs,
            ..Pool::default()
        }
    }

    async fn diff(
        severity: &SeverityConfig,
        leds: &HashMap<String, LedIndicator>,
        old: &[Pool],
        new: &[Pool],
    ) -> (Vec<(MsgKind, Severity, String)>, HashMap<String, LedIndicator>) {
        let (notify, captured) = capture_notifier();
        let leds_out = compare_pool_status(&notify, severity, leds, old, new)
            .await
            .unwrap();
        notify.close().await.unwrap();
        let msgs = captured.lock().unwrap().clone();
        (msgs, leds_out)
    }

    #[tokio::test]
    async fn identical_snapshots_emit_nothing() {
        let severity = SeverityConfig::default();
        let pools = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let (msgs, leds) = diff(&severity, &HashMap::new(), &pools, &pools).await;
        assert!(msgs.is_empty());
        assert!(leds.is_empty());
    }

    #[tokio::test]
    async fn read_error_increase_notifies_with_attachment() {
        let mut severity = SeverityConfig::default();
        severity.dev_read_errors_increased = Severity::Err;
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let new = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 5, 0, 0)])];
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &new).await;

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].0, MsgKind::Message);
        assert_eq!(msgs[0].1, Severity::Err);
        assert_eq!(msgs[0].2, r#"pool "tank" device "sda" read errors increased: 0 -> 5"#);
        assert_eq!(msgs[1].0, MsgKind::Attachment);
        assert_eq!(msgs[1].1, Severity::Err);
        assert!(msgs[1].2.contains("pool: tank"));
    }

    #[tokio::test]
    async fn counter_decreases_do_not_fire() {
        let severity = SeverityConfig::default();
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 5, 3, 1)])];
        let new = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &new).await;
        assert!(msgs.is_empty(), "got {msgs:?}");
    }

    #[tokio::test]
    async fn state_change_maps_severity_and_led() {
        let mut severity = SeverityConfig::default();
        severity.dev_state_map.insert("DEGRADED".into(), Severity::Warning);
        let led_map = HashMap::from([("DEGRADED".to_string(), LedIndicator::CriticalArray)]);
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let new = vec![pool("tank", "ONLINE", vec![leaf("sda", "DEGRADED", 0, 0, 0)])];
        let (msgs, leds) = diff(&severity, &led_map, &old, &new).await;

        assert_eq!(msgs[0].1, Severity::Warning);
        assert_eq!(msgs[0].2, r#"pool "tank" device "sda" state changed: ONLINE -> DEGRADED"#);
        assert_eq!(leds["sda"], LedIndicator::CriticalArray);
    }

    #[tokio::test]
    async fn unmapped_state_changes_default_to_info_and_normal_led() {
        let severity = SeverityConfig::default();
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let new = vec![pool("tank", "ONLINE", vec![leaf("sda", "SIDEWAYS", 0, 0, 0)])];
        let (msgs, leds) = diff(&severity, &HashMap::new(), &old, &new).await;
        assert_eq!(msgs[0].1, Severity::Info);
        assert_eq!(leds["sda"], LedIndicator::Normal);
    }

    #[tokio::test]
    async fn new_pool_gets_one_message_and_one_attachment() {
        let severity = SeverityConfig::default();
        let new = vec![pool(
            "tank",
            "ONLINE",
            vec![leaf("sda", "ONLINE", 0, 0, 0), leaf("sdb", "ONLINE", 0, 0, 0)],
        )];
        let (msgs, _) = diff(&severity, &HashMap::new(), &[], &new).await;

        assert_eq!(msgs.len(), 2, "got {msgs:?}");
        assert_eq!(msgs[0].2, r#"pool "tank" added"#);
        assert_eq!(msgs[1].0, MsgKind::Attachment);
    }

    #[tokio::test]
    async fn removed_pool_notifies_without_attachment() {
        let severity = SeverityConfig::default();
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &[]).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].2, r#"pool "tank" removed"#);
    }

    #[tokio::test]
    async fn containers_never_trigger_device_events() {
        let severity = SeverityConfig::default();
        let mirror_old = Dev {
            sub_devs: vec![1, 2],
            parent_dev: None,
            ..leaf("mirror-0", "ONLINE", 0, 0, 0)
        };
        let mirror_new = Dev {
            state: "DEGRADED".into(),
            read: 9,
            ..mirror_old.clone()
        };
        let old = vec![pool("tank", "ONLINE", vec![mirror_old])];
        let new = vec![pool("tank", "ONLINE", vec![mirror_new])];
        let (msgs, leds) = diff(&severity, &HashMap::new(), &old, &new).await;
        assert!(msgs.is_empty(), "got {msgs:?}");
        assert!(leds.is_empty());
    }

    #[tokio::test]
    async fn device_diffs_come_before_pool_level_changes() {
        let severity = SeverityConfig::default();
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let mut newer = pool("tank", "DEGRADED", vec![leaf("sda", "FAULTED", 0, 0, 0)]);
        newer.errors = "1 data errors".into();
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &[newer]).await;

        let texts: Vec<&str> = msgs.iter().map(|m| m.2.as_str()).collect();
        assert_eq!(texts.len(), 4, "got {texts:?}");
        assert!(texts[0].contains(r#"device "sda" state changed"#));
        assert!(texts[1].contains("new errors"));
        assert!(texts[2].contains(r#"pool "tank" state changed: ONLINE -> DEGRADED"#));
        assert_eq!(msgs[3].0, MsgKind::Attachment);
    }

    #[tokio::test]
    async fn attachment_uses_the_worst_severity_seen() {
        let mut severity = SeverityConfig::default();
        severity.dev_read_errors_increased = Severity::Notice;
        severity.dev_state_map.insert("FAULTED".into(), Severity::Crit);
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "ONLINE", 0, 0, 0)])];
        let new = vec![pool("tank", "ONLINE", vec![leaf("sda", "FAULTED", 2, 0, 0)])];
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &new).await;

        let attachment = msgs.last().unwrap();
        assert_eq!(attachment.0, MsgKind::Attachment);
        assert_eq!(attachment.1, Severity::Crit);
    }

    #[tokio::test]
    async fn additional_info_changes_and_clears() {
        let severity = SeverityConfig::default();
        let mut with_rest = leaf("sda", "UNAVAIL", 0, 0, 0);
        with_rest.rest = "cannot open".into();
        let old = vec![pool("tank", "ONLINE", vec![leaf("sda", "UNAVAIL", 0, 0, 0)])];
        let new = vec![pool("tank", "ONLINE", vec![with_rest.clone()])];
        let (msgs, _) = diff(&severity, &HashMap::new(), &old, &new).await;
        assert!(msgs[0].2.contains("new additional info: cannot open"));

        let (msgs, _) = diff(
            &severity,
            &HashMap::new(),
            &[pool("tank", "ONLINE", vec![with_rest])],
            &[pool("tank", "ONLINE", vec![leaf("sda", "UNAVAIL", 0, 0, 0)])],
        )
        .await;
        assert!(msgs[0].2.contains("additional info cleared"));
    }

    fn usage(name: &str, used: i64) -> PoolUsage {
        PoolUsage {
            name: name.into(),
            avail: 100 - used,
            used,
            usedsnap: -1,
            usedds: -1,
            usedrefreserv: -1,
            usedchild: -1,
            refer: -1,
            mountpoint: String::new(),
        }
    }

    #[tokio::test]
    async fn highest_crossed_threshold_wins() {
        let used_space = BTreeMap::from([
            (80u8, Severity::Warning),
            (90u8, Severity::Crit),
            (95u8, Severity::Alert),
        ]);
        let old = BTreeMap::from([("tank".to_string(), usage("tank", 70))]);
        let new = BTreeMap::from([("tank".to_string(), usage("tank", 92))]);

        let (notify, captured) = capture_notifier();
        compare_pool_usage(&notify, &used_space, &old, &new).await.unwrap();
        notify.close().await.unwrap();

        let msgs = captured.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].1, Severity::Crit);
        assert_eq!(msgs[0].2, r#"pool "tank" usage reached 90%"#);
    }

    #[tokio::test]
    async fn decreasing_usage_is_silent() {
        let used_space = BTreeMap::from([(80u8, Severity::Warning)]);
        let old = BTreeMap::from([("tank".to_string(), usage("tank", 85))]);
        let new = BTreeMap::from([("tank".to_string(), usage("tank", 70))]);

        let (notify, captured) = capture_notifier();
        compare_pool_usage(&notify, &used_space, &old, &new).await.unwrap();
        notify.close().await.unwrap();
        assert!(captured.lock().unwrap().is_empty());
    }
}
