// Range partitioning of a base query into non-overlapping sub-queries
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, BinaryOperator, Expr, GroupByExpr, Query, Select, SetExpr, Statement,
};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;

use crate::error::{PoolError, Result};
use crate::models::{PartitionDescriptor, PartitionSpec, SubQuery};
use crate::validation::SqlValidator;

/// Alias of the derived table used when a predicate cannot be merged into the query.
const PARTITION_ALIAS: &str = "cx_part";

pub struct PartitionPlanner;

impl PartitionPlanner {
    /// Argument checks that must pass before any connection is touched.
    ///
    /// `max_size` is the pool capacity, or `None` on the one-shot path.
    pub fn validate(spec: &PartitionSpec, max_size: Option<usize>, dialect: &dyn Dialect) -> Result<()> {
        if spec.num < 1 {
            return Err(PoolError::InvalidArgument(
                "partition_num must be at least 1".to_string(),
            ));
        }
        if let Some(max_size) = max_size {
            if spec.num > max_size {
                return Err(PoolError::InvalidArgument(format!(
                    "partition_num ({}) exceeds pool max_size ({})",
                    spec.num, max_size
                )));
            }
        }
        SqlValidator::validate_column(&spec.column, dialect)?;
        if let Some((lower, upper)) = spec.range {
            if lower > upper {
                return Err(PoolError::InvalidArgument(format!(
                    "partition_range lower bound {} is greater than upper bound {}",
                    lower, upper
                )));
            }
        }
        Ok(())
    }

    /// Split the inclusive domain `[lower, upper]` into at most `num` contiguous ranges.
    ///
    /// Earlier partitions absorb the remainder; the last upper bound is inclusive.
    pub fn split(
        column: &str,
        lower: i64,
        upper: i64,
        num: usize,
        include_nulls: bool,
    ) -> Result<Vec<PartitionDescriptor>> {
        if num < 1 {
            return Err(PoolError::InvalidArgument(
                "partition_num must be at least 1".to_string(),
            ));
        }
        if lower > upper {
            return Err(PoolError::InvalidArgument(format!(
                "partition_range lower bound {} is greater than upper bound {}",
                lower, upper
            )));
        }

        let domain = i128::from(upper) - i128::from(lower) + 1;
        let parts = domain.min(num as i128);
        let width = domain / parts;
        let remainder = domain % parts;

        let mut descriptors = Vec::with_capacity(parts as usize);
        let mut start = i128::from(lower);
        for index in 0..parts {
            let end = start + width + i128::from(index < remainder);
            let last = index == parts - 1;
            descriptors.push(PartitionDescriptor {
                index: index as usize,
                column: column.to_string(),
                lower_bound: start as i64,
                upper_bound: if last { upper } else { end as i64 },
                upper_inclusive: last,
                include_nulls: include_nulls && index == 0,
            });
            start = end;
        }
        Ok(descriptors)
    }

    /// Build the sub-queries for a resolved range.
    ///
    /// `range` is `None` when the partition column holds no values at all, in which
    /// case the base query runs as a single partition.
    pub fn plan(
        base_sql: &str,
        spec: &PartitionSpec,
        range: Option<(i64, i64)>,
        range_inferred: bool,
        dialect: &dyn Dialect,
    ) -> Result<Vec<SubQuery>> {
        let (lower, upper) = match range {
            Some(range) => range,
            None => return Ok(vec![Self::unpartitioned(base_sql)]),
        };

        Self::split(&spec.column, lower, upper, spec.num, range_inferred)?
            .into_iter()
            .map(|descriptor| {
                let sql = inject_predicate(base_sql, &descriptor, dialect)?;
                Ok(SubQuery {
                    index: descriptor.index,
                    sql,
                    partition: Some(descriptor),
                })
            })
            .collect()
    }

    pub fn unpartitioned(base_sql: &str) -> SubQuery {
        SubQuery {
            index: 0,
            sql: base_sql.to_string(),
            partition: None,
        }
    }
}

/// Restrict `sql` to the rows of `partition`.
///
/// A plain SELECT gets the predicate AND-ed onto its WHERE clause. Anything whose
/// meaning would change under an extra filter (aggregation, DISTINCT, LIMIT, set
/// operations, window functions) is wrapped in a derived table instead, where the
/// column is referenced by its output name.
pub fn inject_predicate(
    sql: &str,
    partition: &PartitionDescriptor,
    dialect: &dyn Dialect,
) -> Result<String> {
    let mut statements = Parser::parse_sql(dialect, sql)
        .map_err(|e| PoolError::InvalidSql(format!("SQL parsing error: {}", e)))?;

    if let [Statement::Query(query)] = statements.as_mut_slice() {
        if let Some(select) = mergeable_select(query) {
            let predicate_expr = parse_predicate(&partition.predicate(), dialect)?;
            select.selection = Some(match select.selection.take() {
                Some(existing) => Expr::BinaryOp {
                    left: Box::new(Expr::Nested(Box::new(existing))),
                    op: BinaryOperator::And,
                    right: Box::new(Expr::Nested(Box::new(predicate_expr))),
                },
                None => predicate_expr,
            });
            return Ok(statements[0].to_string());
        }
    }

    let outer = PartitionDescriptor {
        column: SqlValidator::output_column(&partition.column, dialect)?,
        ..partition.clone()
    };
    let predicate = outer.predicate();
    parse_predicate(&predicate, dialect)?;
    Ok(format!(
        "SELECT * FROM ({}) AS {} WHERE {}",
        sql, PARTITION_ALIAS, predicate
    ))
}

fn parse_predicate(predicate: &str, dialect: &dyn Dialect) -> Result<Expr> {
    Parser::new(dialect)
        .try_with_sql(predicate)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| PoolError::InvalidSql(format!("invalid partition predicate: {}", e)))
}

fn mergeable_select(query: &mut Query) -> Option<&mut Select> {
    if query.limit_clause.is_some() || query.fetch.is_some() {
        return None;
    }
    let select = match query.body.as_mut() {
        SetExpr::Select(select) => select.as_mut(),
        _ => return None,
    };

    let grouped = match &select.group_by {
        GroupByExpr::All(_) => true,
        GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
    };
    if grouped
        || select.having.is_some()
        || select.distinct.is_some()
        || select.top.is_some()
        || select.qualify.is_some()
        || has_window_function(&select.projection)
    {
        return None;
    }
    Some(select)
}

fn has_window_function<V: sqlparser::ast::Visit>(node: &V) -> bool {
    let found = visit_expressions(node, |expr| match expr {
        Expr::Function(function) if function.over.is_some() => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    });
    found.is_break()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::{GenericDialect, SQLiteDialect};

    fn ranges(parts: &[PartitionDescriptor]) -> Vec<(i64, i64, bool)> {
        parts
            .iter()
            .map(|p| (p.lower_bound, p.upper_bound, p.upper_inclusive))
            .collect()
    }

    #[test]
    fn test_split_gives_remainder_to_earlier_partitions() {
        let parts = PartitionPlanner::split("a", 0, 6, 3, false).unwrap();
        assert_eq!(ranges(&parts), vec![(0, 3, false), (3, 5, false), (5, 6, true)]);
        assert_eq!(parts[0].predicate(), "a >= 0 AND a < 3");
        assert_eq!(parts[2].predicate(), "a >= 5 AND a <= 6");
    }

    #[test]
    fn test_split_clamps_to_domain_size() {
        let parts = PartitionPlanner::split("a", 10, 11, 5, false).unwrap();
        assert_eq!(ranges(&parts), vec![(10, 11, false), (11, 11, true)]);

        let parts = PartitionPlanner::split("a", 4, 4, 3, false).unwrap();
        assert_eq!(ranges(&parts), vec![(4, 4, true)]);
    }

    #[test]
    fn test_split_covers_domain_without_overlap() {
        for num in 1..=9 {
            let parts = PartitionPlanner::split("a", -7, 23, num, false).unwrap();
            let mut covered = Vec::new();
            for part in &parts {
                let end = if part.upper_inclusive {
                    part.upper_bound + 1
                } else {
                    part.upper_bound
                };
                covered.extend(part.lower_bound..end);
            }
            assert_eq!(covered, (-7..=23).collect::<Vec<_>>(), "num = {}", num);
            assert_eq!(parts.len(), num);
        }
    }

    #[test]
    fn test_split_handles_extreme_bounds() {
        let parts = PartitionPlanner::split("a", i64::MIN, i64::MAX, 4, false).unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].lower_bound, i64::MIN);
        assert_eq!(parts[3].upper_bound, i64::MAX);
        assert!(parts[3].upper_inclusive);
    }

    #[test]
    fn test_only_first_partition_takes_nulls() {
        let parts = PartitionPlanner::split("a", 0, 9, 2, true).unwrap();
        assert!(parts[0].include_nulls);
        assert!(!parts[1].include_nulls);
    }

    #[test]
    fn test_validate() {
        let dialect = GenericDialect {};
        let spec = PartitionSpec {
            column: "a".to_string(),
            range: Some((0, 6)),
            num: 5,
        };
        let err = PartitionPlanner::validate(&spec, Some(3), &dialect).unwrap_err();
        assert!(matches!(err, PoolError::InvalidArgument(_)));
        assert!(err.to_string().contains("partition_num"));
        assert!(PartitionPlanner::validate(&spec, None, &dialect).is_ok());

        let spec = PartitionSpec {
            num: 0,
            ..spec.clone()
        };
        assert!(PartitionPlanner::validate(&spec, None, &dialect).is_err());

        let spec = PartitionSpec {
            column: "a".to_string(),
            range: Some((5, 1)),
            num: 2,
        };
        assert!(PartitionPlanner::validate(&spec, None, &dialect).is_err());
    }

    fn first_third(column: &str) -> PartitionDescriptor {
        PartitionDescriptor {
            index: 0,
            column: column.to_string(),
            lower_bound: 0,
            upper_bound: 3,
            upper_inclusive: false,
            include_nulls: false,
        }
    }

    #[test]
    fn test_inject_into_plain_select() {
        let sql = inject_predicate("SELECT a, b FROM t", &first_third("a"), &SQLiteDialect {})
            .unwrap();
        assert_eq!(sql, "SELECT a, b FROM t WHERE a >= 0 AND a < 3");
    }

    #[test]
    fn test_inject_preserves_existing_filter() {
        let sql = inject_predicate(
            "SELECT * FROM t WHERE c = 'x' OR d > 1 ORDER BY a",
            &first_third("a"),
            &SQLiteDialect {},
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE (c = 'x' OR d > 1) AND (a >= 0 AND a < 3) ORDER BY a"
        );
    }

    #[test]
    fn test_inject_wraps_aggregates_and_limits() {
        let cases = [
            "SELECT a, COUNT(*) AS n FROM t GROUP BY a",
            "SELECT DISTINCT a FROM t",
            "SELECT a FROM t LIMIT 10",
            "SELECT a FROM t UNION ALL SELECT a FROM u",
            "SELECT a, ROW_NUMBER() OVER (ORDER BY b) AS rn FROM t",
        ];
        for base in cases {
            let sql = inject_predicate(base, &first_third("a"), &SQLiteDialect {}).unwrap();
            assert_eq!(
                sql,
                format!("SELECT * FROM ({}) AS cx_part WHERE a >= 0 AND a < 3", base),
                "{}",
                base
            );
        }
    }

    #[test]
    fn test_qualified_column_outside_derived_table() {
        let dialect = SQLiteDialect {};
        let sql = inject_predicate("SELECT t.a FROM t", &first_third("t.a"), &dialect).unwrap();
        assert_eq!(sql, "SELECT t.a FROM t WHERE t.a >= 0 AND t.a < 3");

        let sql =
            inject_predicate("SELECT DISTINCT t.a FROM t", &first_third("t.a"), &dialect).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT DISTINCT t.a FROM t) AS cx_part WHERE a >= 0 AND a < 3"
        );
    }

    #[test]
    fn test_plan_without_values_is_single_partition() {
        let spec = PartitionSpec {
            column: "a".to_string(),
            range: None,
            num: 3,
        };
        let plan = PartitionPlanner::plan("SELECT * FROM t", &spec, None, true, &SQLiteDialect {})
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].sql, "SELECT * FROM t");
        assert!(plan[0].partition.is_none());
    }

    #[test]
    fn test_plan_with_inferred_range() {
        let spec = PartitionSpec {
            column: "a".to_string(),
            range: None,
            num: 2,
        };
        let plan =
            PartitionPlanner::plan("SELECT * FROM t", &spec, Some((0, 5)), true, &SQLiteDialect {})
                .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan[0].sql,
            "SELECT * FROM t WHERE (a >= 0 AND a < 3) OR a IS NULL"
        );
        assert_eq!(plan[1].sql, "SELECT * FROM t WHERE a >= 3 AND a <= 5");
    }
}
