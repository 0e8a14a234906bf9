/*! Integration tests for arbordb.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - storage: reads, writes, inline/dedicated placement, array constraints
 * - events: subscriptions, event granularity and payloads
 * - transactions: transactional updates and retry behavior
 * - query: the planner/executor, sorting, pagination, live queries
 * - indexes: index creation, incremental maintenance, specialized operators
 * - persistence: backend save/load round trips
 */

mod events;
mod helpers;
mod indexes;
mod persistence;
mod query;
mod storage;
mod transactions;
