//! World-Time Service (spec §4.10, component C10).
//!
//! Holds `Campaign.currentWorldTime`: a domain-defined monotonic instant,
//! independent of wall-clock time, that every Entity Store write anchors
//! its validity interval to when the caller doesn't supply one explicitly.

use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::{ServiceError, ServiceResult};
use crate::event_bus::{Event, EventBus};

pub struct WorldTimeService<'a> {
    pub cache: &'a Cache,
    pub event_bus: &'a dyn EventBus,
}

impl<'a> WorldTimeService<'a> {
    /// Reads `Campaign.currentWorldTime`. `Ok(None)` means the campaign
    /// exists but has never had its clock advanced.
    pub fn get_current(&self, conn: &mut PgConnection, campaign_id: Uuid) -> ServiceResult<Option<i64>> {
        use crate::schema::campaigns::dsl;

        let current: Option<i64> = dsl::campaigns
            .filter(dsl::id.eq(campaign_id))
            .select(dsl::current_world_time)
            .first(conn)
            .optional()?
            .ok_or(ServiceError::NotFound)?;

        Ok(current)
    }

    /// Advances the campaign's world-time clock to `to`. Rejects moving it
    /// backward unless `allow_rewind` is set — the caller's explicit
    /// acknowledgement that they mean to rewrite history rather than having
    /// passed a stale value by mistake (spec §4.10: "unless explicitly
    /// rewinding is allowed by caller").
    pub fn advance(
        &self,
        conn: &mut PgConnection,
        campaign_id: Uuid,
        to: i64,
        allow_rewind: bool,
        invalidate_cache: bool,
    ) -> ServiceResult<i64> {
        use crate::schema::campaigns::dsl;

        conn.transaction(|conn| {
            let current: Option<i64> = dsl::campaigns
                .filter(dsl::id.eq(campaign_id))
                .select(dsl::current_world_time)
                .first(conn)
                .optional()?
                .ok_or(ServiceError::NotFound)?;

            if let Some(current) = current {
                if to <= current && !allow_rewind {
                    return Err(ServiceError::bad_request(format!(
                        "world time must advance: current={current}, requested={to}"
                    )));
                }
            }

            diesel::update(dsl::campaigns.filter(dsl::id.eq(campaign_id)))
                .set((dsl::current_world_time.eq(to), dsl::updated_at.eq(Utc::now())))
                .execute(conn)?;

            if invalidate_cache {
                self.cache.invalidate_graphs_for_campaign(campaign_id);
            }

            self.event_bus.publish(Event::WorldTimeChanged { campaign_id, to, at: Utc::now() });

            Ok(to)
        })
    }

    /// The world time an Entity Store write should anchor to when the
    /// caller supplied none: the campaign's current world time, falling
    /// back to wall-clock `now()` if that's also unset (spec §4.10).
    pub fn resolve_write_time(&self, conn: &mut PgConnection, campaign_id: Uuid, explicit: Option<i64>) -> ServiceResult<i64> {
        if let Some(t) = explicit {
            return Ok(t);
        }
        match self.get_current(conn, campaign_id)? {
            Some(t) => Ok(t),
            None => Ok(Utc::now().timestamp_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::db::test_support::test_connection;
    use crate::event_bus::InProcessEventBus;
    use diesel::Connection;

    fn seed_campaign(conn: &mut PgConnection) -> Uuid {
        use crate::schema::campaigns;

        let campaign_id = Uuid::new_v4();
        diesel::insert_into(campaigns::table)
            .values((
                campaigns::id.eq(campaign_id),
                campaigns::world_id.eq(Uuid::new_v4()),
                campaigns::owner_id.eq(Uuid::new_v4()),
            ))
            .execute(conn)
            .unwrap();
        campaign_id
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn advance_rejects_backward_movement_without_rewind_flag() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let svc = WorldTimeService { cache: &cache, event_bus: &bus };

        let campaign_id = seed_campaign(&mut conn);
        svc.advance(&mut conn, campaign_id, 100, false, false).unwrap();

        let err = svc.advance(&mut conn, campaign_id, 50, false, false).unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn advance_allows_rewind_when_explicitly_permitted() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let svc = WorldTimeService { cache: &cache, event_bus: &bus };

        let campaign_id = seed_campaign(&mut conn);
        svc.advance(&mut conn, campaign_id, 100, false, false).unwrap();
        let result = svc.advance(&mut conn, campaign_id, 50, true, false);
        assert!(result.is_ok());
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn resolve_write_time_falls_back_to_campaign_current_time() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let svc = WorldTimeService { cache: &cache, event_bus: &bus };

        let campaign_id = seed_campaign(&mut conn);
        svc.advance(&mut conn, campaign_id, 77, false, false).unwrap();

        let resolved = svc.resolve_write_time(&mut conn, campaign_id, None).unwrap();
        assert_eq!(resolved, 77);
    }
}
