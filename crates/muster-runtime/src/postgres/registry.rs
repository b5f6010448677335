use std::collections::BTreeMap;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use muster_core::cluster::{
    BoxFuture, CreateServiceResponse, ExistResponse, GetServiceResponse, HealthCheck,
    InstanceIdentity, ListInstancesResponse, RegisterInstanceResponse, RegistryClient,
    RegistryScope, ResponseCode, ResponseStatus, ServiceIdentity, ServiceKey,
};
use muster_core::config::HealthCheckMode;
use muster_core::error::Result;

/// Registry backed by PostgreSQL tables.
///
/// An instance whose last heartbeat is older than its lease counts as
/// gone: renewals fail with `INSTANCE_NOT_EXISTS` and listings skip it.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete instances whose lease has run out.
    pub async fn evict_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM muster_instances
            WHERE last_heartbeat < NOW() - make_interval(secs => lease_secs::double precision)
            "#,
        )
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!("Evicted {} expired instances", count);
        }
        Ok(count)
    }

    async fn do_exist(&self, scope: &RegistryScope, key: &ServiceKey) -> Result<ExistResponse> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT service_id FROM muster_services
            WHERE domain = $1 AND project = $2
              AND environment = $3 AND app_id = $4 AND service_name = $5 AND version = $6
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(&key.environment)
        .bind(&key.app_id)
        .bind(&key.service_name)
        .bind(&key.version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((service_id,)) => ExistResponse {
                status: ResponseStatus::success(),
                service_id,
            },
            None => ExistResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceNotExists,
                    format!("service {} does not exist", key),
                ),
                service_id: String::new(),
            },
        })
    }

    async fn do_get_service(
        &self,
        scope: &RegistryScope,
        service_id: &str,
    ) -> Result<GetServiceResponse> {
        let row = sqlx::query(
            r#"
            SELECT service_id, environment, app_id, service_name, version, description, level
            FROM muster_services
            WHERE domain = $1 AND project = $2 AND service_id = $3
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => GetServiceResponse {
                status: ResponseStatus::success(),
                service: Some(ServiceIdentity {
                    service_id: row.get("service_id"),
                    environment: row.get("environment"),
                    app_id: row.get("app_id"),
                    service_name: row.get("service_name"),
                    version: row.get("version"),
                    description: row.get("description"),
                    level: row.get("level"),
                }),
            },
            None => GetServiceResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceNotExists,
                    format!("service {} does not exist", service_id),
                ),
                service: None,
            },
        })
    }

    async fn do_create_service(
        &self,
        scope: &RegistryScope,
        service: &ServiceIdentity,
    ) -> Result<CreateServiceResponse> {
        let service_id = new_id();
        let result = sqlx::query(
            r#"
            INSERT INTO muster_services (
                domain, project, service_id, environment, app_id,
                service_name, version, description, level
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(&service_id)
        .bind(&service.environment)
        .bind(&service.app_id)
        .bind(&service.service_name)
        .bind(&service.version)
        .bind(&service.description)
        .bind(&service.level)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(CreateServiceResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceAlreadyExists,
                    format!("service {} already exists", service.key()),
                ),
                service_id: String::new(),
            });
        }

        Ok(CreateServiceResponse {
            status: ResponseStatus::success(),
            service_id,
        })
    }

    async fn do_register_instance(
        &self,
        scope: &RegistryScope,
        instance: &InstanceIdentity,
    ) -> Result<RegisterInstanceResponse> {
        self.evict_expired().await?;

        let instance_id = new_id();
        let endpoints = serde_json::to_value(&instance.endpoints)?;
        let properties = serde_json::to_value(&instance.properties)?;

        // Inserting through a SELECT makes a missing service a zero-row insert.
        let result = sqlx::query(
            r#"
            INSERT INTO muster_instances (
                domain, project, instance_id, service_id, host_name, endpoints, properties,
                health_mode, health_interval, health_times, lease_secs
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            WHERE EXISTS (
                SELECT 1 FROM muster_services
                WHERE domain = $1 AND project = $2 AND service_id = $4
            )
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(&instance_id)
        .bind(&instance.service_id)
        .bind(&instance.host_name)
        .bind(endpoints)
        .bind(properties)
        .bind(instance.health_check.mode.as_str())
        .bind(instance.health_check.interval as i64)
        .bind(instance.health_check.times as i32)
        .bind(instance.lease_secs() as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(RegisterInstanceResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceNotExists,
                    format!("service {} does not exist", instance.service_id),
                ),
                instance_id: String::new(),
            });
        }

        Ok(RegisterInstanceResponse {
            status: ResponseStatus::success(),
            instance_id,
        })
    }

    async fn do_heartbeat(
        &self,
        scope: &RegistryScope,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ResponseStatus> {
        let result = sqlx::query(
            r#"
            UPDATE muster_instances
            SET last_heartbeat = NOW()
            WHERE domain = $1 AND project = $2 AND service_id = $3 AND instance_id = $4
              AND last_heartbeat >= NOW() - make_interval(secs => lease_secs::double precision)
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(service_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(instance_missing(service_id, instance_id));
        }
        Ok(ResponseStatus::success())
    }

    async fn do_unregister_instance(
        &self,
        scope: &RegistryScope,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ResponseStatus> {
        let result = sqlx::query(
            r#"
            DELETE FROM muster_instances
            WHERE domain = $1 AND project = $2 AND service_id = $3 AND instance_id = $4
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(service_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(instance_missing(service_id, instance_id));
        }
        Ok(ResponseStatus::success())
    }

    async fn do_list_instances(
        &self,
        scope: &RegistryScope,
        service_id: &str,
    ) -> Result<ListInstancesResponse> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, service_id, host_name, endpoints, properties,
                   health_mode, health_interval, health_times
            FROM muster_instances
            WHERE domain = $1 AND project = $2 AND service_id = $3
              AND last_heartbeat >= NOW() - make_interval(secs => lease_secs::double precision)
            ORDER BY registered_at
            "#,
        )
        .bind(&scope.domain)
        .bind(&scope.project)
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let endpoints: serde_json::Value = row.get("endpoints");
            let properties: serde_json::Value = row.get("properties");
            let mode: String = row.get("health_mode");

            instances.push(InstanceIdentity {
                service_id: row.get("service_id"),
                instance_id: row.get("instance_id"),
                host_name: row.get("host_name"),
                endpoints: serde_json::from_value::<Vec<String>>(endpoints)?,
                health_check: HealthCheck {
                    mode: parse_mode(&mode),
                    interval: row.get::<i64, _>("health_interval") as u64,
                    times: row.get::<i32, _>("health_times") as u32,
                },
                properties: serde_json::from_value::<BTreeMap<String, String>>(properties)?,
            });
        }

        Ok(ListInstancesResponse {
            status: ResponseStatus::success(),
            instances,
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn instance_missing(service_id: &str, instance_id: &str) -> ResponseStatus {
    ResponseStatus::failure(
        ResponseCode::InstanceNotExists,
        format!("instance {}/{} does not exist", service_id, instance_id),
    )
}

fn parse_mode(s: &str) -> HealthCheckMode {
    match s {
        "pull" => HealthCheckMode::Pull,
        _ => HealthCheckMode::Push,
    }
}

impl RegistryClient for PgRegistry {
    fn exist<'a>(
        &'a self,
        scope: &'a RegistryScope,
        key: &'a ServiceKey,
    ) -> BoxFuture<'a, Result<ExistResponse>> {
        Box::pin(self.do_exist(scope, key))
    }

    fn get_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<GetServiceResponse>> {
        Box::pin(self.do_get_service(scope, service_id))
    }

    fn create_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service: &'a ServiceIdentity,
    ) -> BoxFuture<'a, Result<CreateServiceResponse>> {
        Box::pin(self.do_create_service(scope, service))
    }

    fn register_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        instance: &'a InstanceIdentity,
    ) -> BoxFuture<'a, Result<RegisterInstanceResponse>> {
        Box::pin(self.do_register_instance(scope, instance))
    }

    fn heartbeat<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>> {
        Box::pin(self.do_heartbeat(scope, service_id, instance_id))
    }

    fn unregister_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>> {
        Box::pin(self.do_unregister_instance(scope, service_id, instance_id))
    }

    fn list_instances<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<ListInstancesResponse>> {
        Box::pin(self.do_list_instances(scope, service_id))
    }
}
