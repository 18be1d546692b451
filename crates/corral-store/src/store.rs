//! SQLite-backed object store.
//!
//! One connection guarded by a mutex, shared by every task in the
//! process. All statements are short; the mutex is never held across an
//! await point. Cross-process coordination (multiple conductors against
//! one database) relies on SQLite's own locking plus the busy timeout
//! set at open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use tracing::debug;

use corral_common::status::{ClusterStatus, Coe, HealthStatus, NodeGroupRole, ServerType};
use corral_common::{Error, RequestContext, Result};

use crate::filters::{
    ClusterFilters, ListQuery, NodeGroupFilters, QuotaFilters, TemplateFilters, X509Filters,
};
use crate::objects::{
    Cluster, ClusterLockRow, ClusterStats, ClusterTemplate, Federation, NodeGroup, Quota,
    ServiceRecord, X509KeyPair,
};
use crate::schema;

const CLUSTER_SORT_KEYS: &[&str] = &[
    "uuid",
    "name",
    "project_id",
    "status",
    "created_at",
    "updated_at",
];
const TEMPLATE_SORT_KEYS: &[&str] = &[
    "uuid",
    "name",
    "project_id",
    "coe",
    "created_at",
    "updated_at",
];
const NODEGROUP_SORT_KEYS: &[&str] = &[
    "uuid",
    "name",
    "role",
    "node_count",
    "status",
    "created_at",
    "updated_at",
];
const X509_SORT_KEYS: &[&str] = &["uuid", "name", "cluster_uuid", "created_at"];
const QUOTA_SORT_KEYS: &[&str] = &["project_id", "resource", "created_at"];

/// The relational object store shared by all conductor tasks.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and initialize) a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::database(e.to_string()))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory store (tests, dev mode).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::database(e.to_string()))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Cluster templates
    // =========================================================================

    pub fn create_cluster_template(&self, template: &ClusterTemplate) -> Result<()> {
        let conn = self.lock();

        // (project_id, name) must be unique among non-public entries
        let duplicate: Option<String> = conn
            .query_row(
                "SELECT uuid FROM cluster_template
                 WHERE project_id = ?1 AND name = ?2 AND public = 0",
                params![template.project_id, template.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if duplicate.is_some() {
            return Err(Error::already_exists("ClusterTemplate", &template.name));
        }

        let result = conn.execute(
            "INSERT INTO cluster_template (
                uuid, name, project_id, user_id, image_ref, flavor, master_flavor,
                keypair, external_network, fixed_network, fixed_subnet, network_driver,
                volume_driver, dns_nameserver, apiserver_port, docker_volume_size,
                docker_storage_driver, cluster_distro, coe, labels, http_proxy,
                https_proxy, no_proxy, registry_enabled, tls_disabled, public, hidden,
                server_type, insecure_registry, master_lb_enabled, floating_ip_enabled,
                tags, driver, created_at, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                       ?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34,?35)",
            params![
                template.uuid,
                template.name,
                template.project_id,
                template.user_id,
                template.image_ref,
                template.flavor,
                template.master_flavor,
                template.keypair,
                template.external_network,
                template.fixed_network,
                template.fixed_subnet,
                template.network_driver,
                template.volume_driver,
                template.dns_nameserver,
                template.apiserver_port,
                template.docker_volume_size,
                template.docker_storage_driver,
                template.cluster_distro,
                template.coe.as_str(),
                to_json(&template.labels)?,
                template.http_proxy,
                template.https_proxy,
                template.no_proxy,
                template.registry_enabled,
                template.tls_disabled,
                template.public,
                template.hidden,
                template.server_type.as_str(),
                template.insecure_registry,
                template.master_lb_enabled,
                template.floating_ip_enabled,
                template.tags,
                template.driver,
                to_ts(template.created_at),
                template.updated_at.map(to_ts),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::already_exists("ClusterTemplate", &template.uuid))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_cluster_template_by_uuid(
        &self,
        ctx: &RequestContext,
        uuid: &str,
    ) -> Result<ClusterTemplate> {
        let conn = self.lock();
        let template = conn
            .query_row(
                "SELECT * FROM cluster_template WHERE uuid = ?1",
                params![uuid],
                row_to_template,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("ClusterTemplate", uuid))?;

        if !ctx.is_admin && !template.public && template.project_id != ctx.project_id {
            // Hidden from other tenants rather than revealed as forbidden
            return Err(Error::not_found("ClusterTemplate", uuid));
        }
        Ok(template)
    }

    pub fn get_cluster_template_by_name(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<ClusterTemplate> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM cluster_template
                 WHERE name = ?1 AND (project_id = ?2 OR public = 1 OR ?3)",
            )
            .map_err(db_err)?;
        let rows: Vec<ClusterTemplate> = stmt
            .query_map(
                params![name, ctx.project_id, ctx.is_admin],
                row_to_template,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;

        match rows.len() {
            0 => Err(Error::not_found("ClusterTemplate", name)),
            1 => Ok(rows.into_iter().next().expect("len checked")),
            n => Err(Error::conflict(format!(
                "{} cluster templates match name '{}'",
                n, name
            ))),
        }
    }

    pub fn list_cluster_templates(
        &self,
        ctx: &RequestContext,
        filters: &TemplateFilters,
        query: &ListQuery,
    ) -> Result<Vec<ClusterTemplate>> {
        let sort = query.sort_column(TEMPLATE_SORT_KEYS)?;
        let mut sql = String::from("SELECT * FROM cluster_template WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if ctx.lists_all_tenants() {
            if let Some(project) = &filters.project_id {
                sql.push_str(" AND project_id = ?");
                args.push(Box::new(project.clone()));
            }
        } else {
            sql.push_str(" AND (project_id = ? OR public = 1)");
            args.push(Box::new(ctx.project_id.clone()));
        }
        if let Some(name) = &filters.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(image) = &filters.image_id {
            sql.push_str(" AND image_ref = ?");
            args.push(Box::new(image.clone()));
        }
        if let Some(public) = filters.public {
            sql.push_str(" AND public = ?");
            args.push(Box::new(public));
        }
        // Hidden templates stay out of listings unless asked for
        match filters.hidden {
            Some(hidden) => {
                sql.push_str(" AND hidden = ?");
                args.push(Box::new(hidden));
            }
            None => sql.push_str(" AND hidden = 0"),
        }

        sql.push_str(&format!(" ORDER BY {} {}", sort, query.sort_dir.sql()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows: Vec<ClusterTemplate> = stmt
            .query_map(params_from_iter(param_refs), row_to_template)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        drop(stmt);
        drop(conn);

        paginate(rows, query, |t| t.uuid.as_str())
    }

    pub fn update_cluster_template(&self, uuid: &str, template: &ClusterTemplate) -> Result<()> {
        if template.uuid != uuid {
            return Err(Error::invalid_field("uuid", "uuid cannot be changed"));
        }
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE cluster_template SET
                    name = ?2, labels = ?3, public = ?4, hidden = ?5, tags = ?6,
                    updated_at = ?7
                 WHERE uuid = ?1",
                params![
                    uuid,
                    template.name,
                    to_json(&template.labels)?,
                    template.public,
                    template.hidden,
                    template.tags,
                    to_ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found("ClusterTemplate", uuid));
        }
        Ok(())
    }

    pub fn destroy_cluster_template(&self, uuid: &str) -> Result<()> {
        let conn = self.lock();
        let referencing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM cluster WHERE cluster_template_id = ?1",
                params![uuid],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if referencing > 0 {
            return Err(Error::TemplateReferenced {
                template: uuid.to_string(),
            });
        }
        let deleted = conn
            .execute("DELETE FROM cluster_template WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found("ClusterTemplate", uuid));
        }
        Ok(())
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    pub fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO cluster (
                uuid, name, project_id, user_id, cluster_template_id, stack_id,
                status, status_reason, health_status, health_status_reason,
                create_timeout, api_address, discovery_url, coe_version,
                container_version, trustee_username, trustee_user_id,
                trustee_password, trust_id, ca_cert_ref, client_cert_ref,
                etcd_ca_cert_ref, front_proxy_ca_cert_ref, keypair,
                docker_volume_size, labels, master_flavor_id, flavor_id,
                fixed_network, fixed_subnet, floating_ip_enabled,
                master_lb_enabled, created_at, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,
                       ?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33,?34)",
            params![
                cluster.uuid,
                cluster.name,
                cluster.project_id,
                cluster.user_id,
                cluster.cluster_template_id,
                cluster.stack_id,
                cluster.status.as_str(),
                cluster.status_reason,
                cluster.health_status.as_str(),
                to_json(&cluster.health_status_reason)?,
                cluster.create_timeout_minutes,
                cluster.api_address,
                cluster.discovery_url,
                cluster.coe_version,
                cluster.container_version,
                cluster.trustee_username,
                cluster.trustee_user_id,
                cluster.trustee_password,
                cluster.trust_id,
                cluster.ca_cert_ref,
                cluster.client_cert_ref,
                cluster.etcd_ca_cert_ref,
                cluster.front_proxy_ca_cert_ref,
                cluster.keypair,
                cluster.docker_volume_size,
                to_json(&cluster.labels)?,
                cluster.master_flavor_id,
                cluster.flavor_id,
                cluster.fixed_network,
                cluster.fixed_subnet,
                cluster.floating_ip_enabled,
                cluster.master_lb_enabled,
                to_ts(cluster.created_at),
                cluster.updated_at.map(to_ts),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::already_exists(
                "Cluster",
                format!("{} ({})", cluster.name, cluster.uuid),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_cluster_by_uuid(&self, ctx: &RequestContext, uuid: &str) -> Result<Cluster> {
        let conn = self.lock();
        let cluster = conn
            .query_row(
                "SELECT * FROM cluster WHERE uuid = ?1",
                params![uuid],
                row_to_cluster,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("Cluster", uuid))?;

        if !ctx.is_admin && cluster.project_id != ctx.project_id {
            return Err(Error::not_found("Cluster", uuid));
        }
        Ok(cluster)
    }

    pub fn get_cluster_by_name(&self, ctx: &RequestContext, name: &str) -> Result<Cluster> {
        let conn = self.lock();
        let (sql, scope): (&str, Vec<Box<dyn ToSql>>) = if ctx.lists_all_tenants() {
            ("SELECT * FROM cluster WHERE name = ?1", vec![Box::new(name.to_string())])
        } else {
            (
                "SELECT * FROM cluster WHERE name = ?1 AND project_id = ?2",
                vec![
                    Box::new(name.to_string()),
                    Box::new(ctx.project_id.clone()),
                ],
            )
        };
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = scope.iter().map(|a| a.as_ref()).collect();
        let rows: Vec<Cluster> = stmt
            .query_map(params_from_iter(param_refs), row_to_cluster)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;

        match rows.len() {
            0 => Err(Error::not_found("Cluster", name)),
            1 => Ok(rows.into_iter().next().expect("len checked")),
            n => Err(Error::conflict(format!(
                "{} clusters match name '{}'",
                n, name
            ))),
        }
    }

    /// Resolve a cluster by uuid when the id parses as one, by name otherwise.
    pub fn resolve_cluster(&self, ctx: &RequestContext, id: &str) -> Result<Cluster> {
        if uuid::Uuid::parse_str(id).is_ok() {
            self.get_cluster_by_uuid(ctx, id)
        } else {
            self.get_cluster_by_name(ctx, id)
        }
    }

    pub fn list_clusters(
        &self,
        ctx: &RequestContext,
        filters: &ClusterFilters,
        query: &ListQuery,
    ) -> Result<Vec<Cluster>> {
        let sort = query.sort_column(CLUSTER_SORT_KEYS)?;
        let mut sql = String::from("SELECT * FROM cluster WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if ctx.lists_all_tenants() {
            if let Some(project) = &filters.project_id {
                sql.push_str(" AND project_id = ?");
                args.push(Box::new(project.clone()));
            }
        } else {
            sql.push_str(" AND project_id = ?");
            args.push(Box::new(ctx.project_id.clone()));
        }
        if let Some(name) = &filters.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(template) = &filters.cluster_template_id {
            sql.push_str(" AND cluster_template_id = ?");
            args.push(Box::new(template.clone()));
        }
        if !filters.status.is_empty() {
            let placeholders = vec!["?"; filters.status.len()].join(",");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            for status in &filters.status {
                args.push(Box::new(status.as_str()));
            }
        }
        if let Some(count) = filters.node_count {
            sql.push_str(
                " AND (SELECT COALESCE(SUM(node_count), 0) FROM nodegroup
                       WHERE cluster_id = cluster.uuid AND role = 'worker') = ?",
            );
            args.push(Box::new(count as i64));
        }
        if let Some(count) = filters.master_count {
            sql.push_str(
                " AND (SELECT COALESCE(SUM(node_count), 0) FROM nodegroup
                       WHERE cluster_id = cluster.uuid AND role = 'master') = ?",
            );
            args.push(Box::new(count as i64));
        }

        sql.push_str(&format!(" ORDER BY {} {}", sort, query.sort_dir.sql()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows: Vec<Cluster> = stmt
            .query_map(params_from_iter(param_refs), row_to_cluster)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        drop(stmt);
        drop(conn);

        paginate(rows, query, |c| c.uuid.as_str())
    }

    /// Clusters in any non-terminal state (used for poller recovery).
    pub fn list_in_progress_clusters(&self) -> Result<Vec<Cluster>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM cluster WHERE status LIKE '%_IN_PROGRESS'")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_cluster)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn update_cluster(&self, uuid: &str, cluster: &Cluster) -> Result<()> {
        if cluster.uuid != uuid {
            return Err(Error::invalid_field("uuid", "uuid cannot be changed"));
        }
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE cluster SET
                    name = ?2, stack_id = ?3, status = ?4, status_reason = ?5,
                    health_status = ?6, health_status_reason = ?7, api_address = ?8,
                    discovery_url = ?9, coe_version = ?10, container_version = ?11,
                    trustee_username = ?12, trustee_user_id = ?13,
                    trustee_password = ?14, trust_id = ?15, ca_cert_ref = ?16,
                    client_cert_ref = ?17, etcd_ca_cert_ref = ?18,
                    front_proxy_ca_cert_ref = ?19, labels = ?20,
                    docker_volume_size = ?21, cluster_template_id = ?22,
                    updated_at = ?23
                 WHERE uuid = ?1",
                params![
                    uuid,
                    cluster.name,
                    cluster.stack_id,
                    cluster.status.as_str(),
                    cluster.status_reason,
                    cluster.health_status.as_str(),
                    to_json(&cluster.health_status_reason)?,
                    cluster.api_address,
                    cluster.discovery_url,
                    cluster.coe_version,
                    cluster.container_version,
                    cluster.trustee_username,
                    cluster.trustee_user_id,
                    cluster.trustee_password,
                    cluster.trust_id,
                    cluster.ca_cert_ref,
                    cluster.client_cert_ref,
                    cluster.etcd_ca_cert_ref,
                    cluster.front_proxy_ca_cert_ref,
                    to_json(&cluster.labels)?,
                    cluster.docker_volume_size,
                    cluster.cluster_template_id,
                    to_ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found("Cluster", uuid));
        }
        Ok(())
    }

    /// Destroy a cluster row that has no dependents left.
    pub fn destroy_cluster(&self, uuid: &str) -> Result<()> {
        let conn = self.lock();
        let dependents: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM nodegroup WHERE cluster_id = ?1",
                params![uuid],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if dependents > 0 {
            return Err(Error::ClusterNotEmpty {
                cluster: uuid.to_string(),
            });
        }
        let deleted = conn
            .execute("DELETE FROM cluster WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found("Cluster", uuid));
        }
        Ok(())
    }

    /// Destroy a cluster and its dependent rows as one cascading delete.
    ///
    /// Used by the poller once DELETE reaches its terminal state; the
    /// `ClusterNotEmpty` guard applies only outside this path.
    pub fn destroy_cluster_cascade(&self, uuid: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM nodegroup WHERE cluster_id = ?1", params![uuid])
            .map_err(db_err)?;
        tx.execute(
            "DELETE FROM x509keypair WHERE cluster_uuid = ?1",
            params![uuid],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM cluster_lock WHERE cluster_uuid = ?1",
            params![uuid],
        )
        .map_err(db_err)?;
        let deleted = tx
            .execute("DELETE FROM cluster WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        if deleted == 0 {
            return Err(Error::not_found("Cluster", uuid));
        }
        debug!(cluster = %uuid, "destroyed cluster row and dependents");
        Ok(())
    }

    /// Cluster and node totals, optionally scoped to one project.
    pub fn cluster_stats(&self, project_id: Option<&str>) -> Result<ClusterStats> {
        let conn = self.lock();
        let (clusters, nodes): (i64, i64) = match project_id {
            Some(project) => conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE((SELECT SUM(ng.node_count) FROM nodegroup ng
                                      JOIN cluster c2 ON ng.cluster_id = c2.uuid
                                      WHERE c2.project_id = ?1), 0)
                     FROM cluster WHERE project_id = ?1",
                    params![project],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?,
            None => conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE((SELECT SUM(node_count) FROM nodegroup), 0)
                     FROM cluster",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(db_err)?,
        };
        Ok(ClusterStats {
            cluster_count: clusters as u64,
            total_node_count: nodes as u64,
        })
    }

    pub fn count_clusters_in_project(&self, project_id: &str) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM cluster WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    // =========================================================================
    // Node groups
    // =========================================================================

    pub fn create_nodegroup(&self, nodegroup: &NodeGroup) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO nodegroup (
                uuid, cluster_id, project_id, name, role, flavor_id, image_id,
                node_count, min_node_count, max_node_count, node_addresses, labels,
                status, status_reason, version, stack_id, is_default, created_at,
                updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                nodegroup.uuid,
                nodegroup.cluster_id,
                nodegroup.project_id,
                nodegroup.name,
                nodegroup.role.as_str(),
                nodegroup.flavor_id,
                nodegroup.image_id,
                nodegroup.node_count,
                nodegroup.min_node_count,
                nodegroup.max_node_count,
                to_json(&nodegroup.node_addresses)?,
                to_json(&nodegroup.labels)?,
                nodegroup.status.as_str(),
                nodegroup.status_reason,
                nodegroup.version,
                nodegroup.stack_id,
                nodegroup.is_default,
                to_ts(nodegroup.created_at),
                nodegroup.updated_at.map(to_ts),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::already_exists(
                "NodeGroup",
                format!("{} in cluster {}", nodegroup.name, nodegroup.cluster_id),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_nodegroup(&self, cluster_uuid: &str, id: &str) -> Result<NodeGroup> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM nodegroup
             WHERE cluster_id = ?1 AND (uuid = ?2 OR name = ?2)",
            params![cluster_uuid, id],
            row_to_nodegroup,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("NodeGroup", id))
    }

    pub fn list_nodegroups(
        &self,
        cluster_uuid: &str,
        filters: &NodeGroupFilters,
        query: &ListQuery,
    ) -> Result<Vec<NodeGroup>> {
        let sort = query.sort_column(NODEGROUP_SORT_KEYS)?;
        let mut sql = String::from("SELECT * FROM nodegroup WHERE cluster_id = ?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(cluster_uuid.to_string())];

        if let Some(name) = &filters.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }
        if let Some(role) = filters.role {
            sql.push_str(" AND role = ?");
            args.push(Box::new(role.as_str()));
        }
        if let Some(flavor) = &filters.flavor_id {
            sql.push_str(" AND flavor_id = ?");
            args.push(Box::new(flavor.clone()));
        }
        if let Some(count) = filters.node_count {
            sql.push_str(" AND node_count = ?");
            args.push(Box::new(count as i64));
        }
        if let Some(status) = filters.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str()));
        }

        sql.push_str(&format!(" ORDER BY {} {}", sort, query.sort_dir.sql()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows: Vec<NodeGroup> = stmt
            .query_map(params_from_iter(param_refs), row_to_nodegroup)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        drop(stmt);
        drop(conn);

        paginate(rows, query, |ng| ng.uuid.as_str())
    }

    /// The implicitly created (default-master, default-worker) pair.
    pub fn default_nodegroups(&self, cluster_uuid: &str) -> Result<(NodeGroup, NodeGroup)> {
        let groups =
            self.list_nodegroups(cluster_uuid, &NodeGroupFilters::default(), &ListQuery::default())?;
        let master = groups
            .iter()
            .find(|ng| ng.is_default && ng.role == NodeGroupRole::Master)
            .cloned()
            .ok_or_else(|| Error::not_found("NodeGroup", "default-master"))?;
        let worker = groups
            .iter()
            .find(|ng| ng.is_default && ng.role == NodeGroupRole::Worker)
            .cloned()
            .ok_or_else(|| Error::not_found("NodeGroup", "default-worker"))?;
        Ok((master, worker))
    }

    /// Node groups in any non-terminal state across all clusters.
    pub fn list_in_progress_nodegroups(&self) -> Result<Vec<NodeGroup>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM nodegroup WHERE status LIKE '%_IN_PROGRESS'")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_nodegroup)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn update_nodegroup(&self, uuid: &str, nodegroup: &NodeGroup) -> Result<()> {
        if nodegroup.uuid != uuid {
            return Err(Error::invalid_field("uuid", "uuid cannot be changed"));
        }
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE nodegroup SET
                    name = ?2, flavor_id = ?3, image_id = ?4, node_count = ?5,
                    min_node_count = ?6, max_node_count = ?7, node_addresses = ?8,
                    labels = ?9, status = ?10, status_reason = ?11, version = ?12,
                    stack_id = ?13, updated_at = ?14
                 WHERE uuid = ?1",
                params![
                    uuid,
                    nodegroup.name,
                    nodegroup.flavor_id,
                    nodegroup.image_id,
                    nodegroup.node_count,
                    nodegroup.min_node_count,
                    nodegroup.max_node_count,
                    to_json(&nodegroup.node_addresses)?,
                    to_json(&nodegroup.labels)?,
                    nodegroup.status.as_str(),
                    nodegroup.status_reason,
                    nodegroup.version,
                    nodegroup.stack_id,
                    to_ts(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found("NodeGroup", uuid));
        }
        Ok(())
    }

    pub fn destroy_nodegroup(&self, uuid: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM nodegroup WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found("NodeGroup", uuid));
        }
        Ok(())
    }

    // =========================================================================
    // X509 key pairs
    // =========================================================================

    pub fn create_x509keypair(&self, keypair: &X509KeyPair) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO x509keypair (
                uuid, cluster_uuid, project_id, user_id, name, certificate,
                private_key, private_key_passphrase, intermediates, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                keypair.uuid,
                keypair.cluster_uuid,
                keypair.project_id,
                keypair.user_id,
                keypair.name,
                keypair.certificate,
                keypair.private_key,
                keypair.private_key_passphrase,
                keypair.intermediates,
                to_ts(keypair.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::already_exists("X509KeyPair", &keypair.uuid))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_x509keypair(&self, uuid: &str) -> Result<X509KeyPair> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM x509keypair WHERE uuid = ?1",
            params![uuid],
            row_to_keypair,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("X509KeyPair", uuid))
    }

    pub fn list_x509keypairs(
        &self,
        ctx: &RequestContext,
        filters: &X509Filters,
        query: &ListQuery,
    ) -> Result<Vec<X509KeyPair>> {
        let sort = query.sort_column(X509_SORT_KEYS)?;
        let mut sql = String::from("SELECT * FROM x509keypair WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if ctx.lists_all_tenants() {
            if let Some(project) = &filters.project_id {
                sql.push_str(" AND project_id = ?");
                args.push(Box::new(project.clone()));
            }
        } else {
            sql.push_str(" AND project_id = ?");
            args.push(Box::new(ctx.project_id.clone()));
        }
        if let Some(cluster) = &filters.cluster_uuid {
            sql.push_str(" AND cluster_uuid = ?");
            args.push(Box::new(cluster.clone()));
        }
        if let Some(name) = &filters.name {
            sql.push_str(" AND name = ?");
            args.push(Box::new(name.clone()));
        }

        sql.push_str(&format!(" ORDER BY {} {}", sort, query.sort_dir.sql()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows: Vec<X509KeyPair> = stmt
            .query_map(params_from_iter(param_refs), row_to_keypair)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        drop(stmt);
        drop(conn);

        paginate(rows, query, |k| k.uuid.as_str())
    }

    pub fn destroy_x509keypair(&self, uuid: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM x509keypair WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found("X509KeyPair", uuid));
        }
        Ok(())
    }

    /// Remove every keypair owned by a cluster; returns how many were removed.
    pub fn destroy_x509keypairs_for_cluster(&self, cluster_uuid: &str) -> Result<usize> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM x509keypair WHERE cluster_uuid = ?1",
            params![cluster_uuid],
        )
        .map_err(db_err)
    }

    // =========================================================================
    // Quotas
    // =========================================================================

    pub fn create_quota(&self, quota: &Quota) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO quota (project_id, resource, hard_limit, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                quota.project_id,
                quota.resource,
                quota.hard_limit,
                to_ts(quota.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::already_exists(
                "Quota",
                format!("{}/{}", quota.project_id, quota.resource),
            )),
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_quota(&self, project_id: &str, resource: &str) -> Result<Option<Quota>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM quota WHERE project_id = ?1 AND resource = ?2",
            params![project_id, resource],
            row_to_quota,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn update_quota(&self, project_id: &str, resource: &str, hard_limit: i64) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE quota SET hard_limit = ?3 WHERE project_id = ?1 AND resource = ?2",
                params![project_id, resource, hard_limit],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found(
                "Quota",
                format!("{}/{}", project_id, resource),
            ));
        }
        Ok(())
    }

    pub fn delete_quota(&self, project_id: &str, resource: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM quota WHERE project_id = ?1 AND resource = ?2",
                params![project_id, resource],
            )
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found(
                "Quota",
                format!("{}/{}", project_id, resource),
            ));
        }
        Ok(())
    }

    pub fn list_quotas(&self, filters: &QuotaFilters, query: &ListQuery) -> Result<Vec<Quota>> {
        let sort = query.sort_column(QUOTA_SORT_KEYS)?;
        let mut sql = String::from("SELECT * FROM quota WHERE 1=1");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(project) = &filters.project_id {
            sql.push_str(" AND project_id = ?");
            args.push(Box::new(project.clone()));
        }
        if let Some(resource) = &filters.resource {
            sql.push_str(" AND resource = ?");
            args.push(Box::new(resource.clone()));
        }
        sql.push_str(&format!(" ORDER BY {} {}", sort, query.sort_dir.sql()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt
            .query_map(params_from_iter(param_refs), row_to_quota)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // =========================================================================
    // Service records
    // =========================================================================

    /// Record (or refresh) a worker's liveness. Each call bumps
    /// `report_count` and moves `last_seen_up` forward.
    pub fn service_heartbeat(&self, host: &str, binary: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO service_record (host, binary, last_seen_up, report_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (host, binary) DO UPDATE SET
                 last_seen_up = excluded.last_seen_up,
                 report_count = report_count + 1",
            params![host, binary, to_ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_service(&self, host: &str, binary: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM service_record WHERE host = ?1 AND binary = ?2",
            params![host, binary],
            row_to_service,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM service_record ORDER BY host, binary")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_service)
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn set_service_disabled(
        &self,
        host: &str,
        binary: &str,
        disabled: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE service_record SET disabled = ?3, disabled_reason = ?4
                 WHERE host = ?1 AND binary = ?2",
                params![host, binary, disabled, reason],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found(
                "ServiceRecord",
                format!("{}/{}", host, binary),
            ));
        }
        Ok(())
    }

    pub fn set_service_forced_down(&self, host: &str, binary: &str, down: bool) -> Result<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE service_record SET forced_down = ?3 WHERE host = ?1 AND binary = ?2",
                params![host, binary, down],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found(
                "ServiceRecord",
                format!("{}/{}", host, binary),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Cluster locks
    // =========================================================================

    /// Attempt to take the lock for a cluster.
    ///
    /// Returns `None` when acquired; `Some(holder)` when another
    /// conductor already holds it (the duplicate key is the signal, as
    /// with a lease that is already owned).
    pub fn take_cluster_lock(
        &self,
        cluster_uuid: &str,
        conductor_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO cluster_lock (cluster_uuid, conductor_id, taken_at)
             VALUES (?1, ?2, ?3)",
            params![cluster_uuid, conductor_id, to_ts(Utc::now())],
        );
        match result {
            Ok(_) => Ok(None),
            Err(e) if is_unique_violation(&e) => {
                let holder: Option<String> = conn
                    .query_row(
                        "SELECT conductor_id FROM cluster_lock WHERE cluster_uuid = ?1",
                        params![cluster_uuid],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                // The holder may have released between INSERT and SELECT;
                // report it as busy and let the caller retry.
                Ok(Some(holder.unwrap_or_else(|| "unknown".to_string())))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    /// Release a lock held by this conductor. Returns false when the lock
    /// was not held by `conductor_id` (stolen or already released).
    pub fn release_cluster_lock(&self, cluster_uuid: &str, conductor_id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM cluster_lock WHERE cluster_uuid = ?1 AND conductor_id = ?2",
                params![cluster_uuid, conductor_id],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Take over a lock from a dead conductor.
    ///
    /// Compare-and-swap on the previous holder: the rewrite only happens
    /// if `from_conductor` still holds the lock, so two stealing
    /// conductors cannot both win. Returns true when the steal succeeded.
    pub fn steal_cluster_lock(
        &self,
        cluster_uuid: &str,
        from_conductor: &str,
        to_conductor: &str,
    ) -> Result<bool> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE cluster_lock SET conductor_id = ?3, taken_at = ?4
                 WHERE cluster_uuid = ?1 AND conductor_id = ?2",
                params![cluster_uuid, from_conductor, to_conductor, to_ts(Utc::now())],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn get_cluster_lock(&self, cluster_uuid: &str) -> Result<Option<ClusterLockRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT cluster_uuid, conductor_id, taken_at FROM cluster_lock
             WHERE cluster_uuid = ?1",
            params![cluster_uuid],
            |row| {
                Ok(ClusterLockRow {
                    cluster_uuid: row.get(0)?,
                    conductor_id: row.get(1)?,
                    taken_at: parse_ts_col(row, 2)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    // =========================================================================
    // Federations
    // =========================================================================

    pub fn create_federation(&self, federation: &Federation) -> Result<()> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO federation (
                uuid, name, project_id, hostcluster_id, member_ids, properties,
                status, status_reason, created_at, updated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                federation.uuid,
                federation.name,
                federation.project_id,
                federation.hostcluster_id,
                to_json(&federation.member_ids)?,
                to_json(&federation.properties)?,
                federation.status.as_str(),
                federation.status_reason,
                to_ts(federation.created_at),
                federation.updated_at.map(to_ts),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::already_exists("Federation", &federation.name))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    pub fn get_federation(&self, ctx: &RequestContext, uuid: &str) -> Result<Federation> {
        let conn = self.lock();
        let federation = conn
            .query_row(
                "SELECT * FROM federation WHERE uuid = ?1",
                params![uuid],
                row_to_federation,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found("Federation", uuid))?;
        if !ctx.is_admin && federation.project_id != ctx.project_id {
            return Err(Error::not_found("Federation", uuid));
        }
        Ok(federation)
    }

    pub fn list_federations(&self, ctx: &RequestContext) -> Result<Vec<Federation>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM federation WHERE project_id = ?1 OR ?2 ORDER BY created_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![ctx.project_id, ctx.lists_all_tenants()],
                row_to_federation,
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn destroy_federation(&self, uuid: &str) -> Result<()> {
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM federation WHERE uuid = ?1", params![uuid])
            .map_err(db_err)?;
        if deleted == 0 {
            return Err(Error::not_found("Federation", uuid));
        }
        Ok(())
    }
}

// =============================================================================
// Row mapping and small helpers
// =============================================================================

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn to_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::database(e.to_string()))
}

fn conversion_err(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_err)
}

fn get_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(conversion_err)
}

fn get_opt_ts(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(col)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(conversion_err)
    })
    .transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let text: String = row.get(col)?;
    serde_json::from_str(&text).map_err(conversion_err)
}

fn get_parsed<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let text: String = row.get(col)?;
    text.parse::<T>().map_err(conversion_err)
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<ClusterTemplate> {
    Ok(ClusterTemplate {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        image_ref: row.get("image_ref")?,
        flavor: row.get("flavor")?,
        master_flavor: row.get("master_flavor")?,
        keypair: row.get("keypair")?,
        external_network: row.get("external_network")?,
        fixed_network: row.get("fixed_network")?,
        fixed_subnet: row.get("fixed_subnet")?,
        network_driver: row.get("network_driver")?,
        volume_driver: row.get("volume_driver")?,
        dns_nameserver: row.get("dns_nameserver")?,
        apiserver_port: row
            .get::<_, Option<i64>>("apiserver_port")?
            .map(|p| p as u16),
        docker_volume_size: row.get("docker_volume_size")?,
        docker_storage_driver: row.get("docker_storage_driver")?,
        cluster_distro: row.get("cluster_distro")?,
        coe: get_parsed::<Coe>(row, "coe")?,
        labels: get_json(row, "labels")?,
        http_proxy: row.get("http_proxy")?,
        https_proxy: row.get("https_proxy")?,
        no_proxy: row.get("no_proxy")?,
        registry_enabled: row.get("registry_enabled")?,
        tls_disabled: row.get("tls_disabled")?,
        public: row.get("public")?,
        hidden: row.get("hidden")?,
        server_type: get_parsed::<ServerType>(row, "server_type")?,
        insecure_registry: row.get("insecure_registry")?,
        master_lb_enabled: row.get("master_lb_enabled")?,
        floating_ip_enabled: row.get("floating_ip_enabled")?,
        tags: row.get("tags")?,
        driver: row.get("driver")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_opt_ts(row, "updated_at")?,
    })
}

fn row_to_cluster(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        cluster_template_id: row.get("cluster_template_id")?,
        stack_id: row.get("stack_id")?,
        status: get_parsed::<ClusterStatus>(row, "status")?,
        status_reason: row.get("status_reason")?,
        health_status: get_parsed::<HealthStatus>(row, "health_status")?,
        health_status_reason: get_json(row, "health_status_reason")?,
        create_timeout_minutes: row.get::<_, i64>("create_timeout")? as u32,
        api_address: row.get("api_address")?,
        discovery_url: row.get("discovery_url")?,
        coe_version: row.get("coe_version")?,
        container_version: row.get("container_version")?,
        trustee_username: row.get("trustee_username")?,
        trustee_user_id: row.get("trustee_user_id")?,
        trustee_password: row.get("trustee_password")?,
        trust_id: row.get("trust_id")?,
        ca_cert_ref: row.get("ca_cert_ref")?,
        client_cert_ref: row.get("client_cert_ref")?,
        etcd_ca_cert_ref: row.get("etcd_ca_cert_ref")?,
        front_proxy_ca_cert_ref: row.get("front_proxy_ca_cert_ref")?,
        keypair: row.get("keypair")?,
        docker_volume_size: row.get("docker_volume_size")?,
        labels: get_json(row, "labels")?,
        master_flavor_id: row.get("master_flavor_id")?,
        flavor_id: row.get("flavor_id")?,
        fixed_network: row.get("fixed_network")?,
        fixed_subnet: row.get("fixed_subnet")?,
        floating_ip_enabled: row.get("floating_ip_enabled")?,
        master_lb_enabled: row.get("master_lb_enabled")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_opt_ts(row, "updated_at")?,
    })
}

fn row_to_nodegroup(row: &Row<'_>) -> rusqlite::Result<NodeGroup> {
    Ok(NodeGroup {
        uuid: row.get("uuid")?,
        cluster_id: row.get("cluster_id")?,
        project_id: row.get("project_id")?,
        name: row.get("name")?,
        role: get_parsed::<NodeGroupRole>(row, "role")?,
        flavor_id: row.get("flavor_id")?,
        image_id: row.get("image_id")?,
        node_count: row.get::<_, i64>("node_count")? as u32,
        min_node_count: row.get::<_, i64>("min_node_count")? as u32,
        max_node_count: row
            .get::<_, Option<i64>>("max_node_count")?
            .map(|m| m as u32),
        node_addresses: get_json(row, "node_addresses")?,
        labels: get_json(row, "labels")?,
        status: get_parsed::<ClusterStatus>(row, "status")?,
        status_reason: row.get("status_reason")?,
        version: row.get("version")?,
        stack_id: row.get("stack_id")?,
        is_default: row.get("is_default")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_opt_ts(row, "updated_at")?,
    })
}

fn row_to_keypair(row: &Row<'_>) -> rusqlite::Result<X509KeyPair> {
    Ok(X509KeyPair {
        uuid: row.get("uuid")?,
        cluster_uuid: row.get("cluster_uuid")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        certificate: row.get("certificate")?,
        private_key: row.get("private_key")?,
        private_key_passphrase: row.get("private_key_passphrase")?,
        intermediates: row.get("intermediates")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_quota(row: &Row<'_>) -> rusqlite::Result<Quota> {
    Ok(Quota {
        project_id: row.get("project_id")?,
        resource: row.get("resource")?,
        hard_limit: row.get("hard_limit")?,
        created_at: get_ts(row, "created_at")?,
    })
}

fn row_to_service(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
    Ok(ServiceRecord {
        host: row.get("host")?,
        binary: row.get("binary")?,
        last_seen_up: get_ts(row, "last_seen_up")?,
        report_count: row.get::<_, i64>("report_count")? as u64,
        disabled: row.get("disabled")?,
        forced_down: row.get("forced_down")?,
        disabled_reason: row.get("disabled_reason")?,
    })
}

fn row_to_federation(row: &Row<'_>) -> rusqlite::Result<Federation> {
    Ok(Federation {
        uuid: row.get("uuid")?,
        name: row.get("name")?,
        project_id: row.get("project_id")?,
        hostcluster_id: row.get("hostcluster_id")?,
        member_ids: get_json(row, "member_ids")?,
        properties: get_json(row, "properties")?,
        status: get_parsed::<ClusterStatus>(row, "status")?,
        status_reason: row.get("status_reason")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_opt_ts(row, "updated_at")?,
    })
}

/// Apply marker/limit pagination to an already-sorted row set.
fn paginate<T>(rows: Vec<T>, query: &ListQuery, uuid_of: impl Fn(&T) -> &str) -> Result<Vec<T>> {
    let mut rows = rows;
    if let Some(marker) = &query.marker {
        let position = rows.iter().position(|r| uuid_of(r) == marker);
        match position {
            Some(idx) => {
                rows.drain(..=idx);
            }
            None => {
                return Err(Error::invalid_field(
                    "marker",
                    format!("marker {} not found", marker),
                ))
            }
        }
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit as usize);
    }
    Ok(rows)
}
