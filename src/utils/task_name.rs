//! Utilities for working with task names.

const GEN_SUFFIX: &str = "_gen";

/// Generate a name for a generated sub-task.
///
/// # Arguments
///
/// * `display_name` - Name of parent task being generated.
/// * `sub_task_index` - Index of sub-task being named, `None` for the misc sub-task.
/// * `total_tasks` - Total number of sub-tasks generated for this parent task.
/// * `build_variant` - Name of build variant the sub-task will run on.
pub fn name_generated_task(
    display_name: &str,
    sub_task_index: Option<usize>,
    total_tasks: usize,
    build_variant: &str,
) -> String {
    if let Some(index) = sub_task_index {
        let alignment = digits(total_tasks);
        format!(
            "{}_{:0fill$}_{}",
            display_name,
            index,
            build_variant,
            fill = alignment
        )
    } else {
        format!("{}_misc_{}", display_name, build_variant)
    }
}

/// Name the sub-suite configuration file that a generated sub-task points at.
///
/// Suite files are keyed by the parent task and build variant so that parallel
/// generation for several variants cannot collide on the same filename.
pub fn name_sub_suite_file(
    display_name: &str,
    sub_task_index: Option<usize>,
    total_tasks: usize,
    build_variant: &str,
) -> String {
    format!(
        "{}.yml",
        name_generated_task(display_name, sub_task_index, total_tasks, build_variant)
    )
}

/// Remove the '_gen' from end of the given task name if it exists.
///
/// # Arguments
///
/// * `task_name` - Name of task.
///
/// # Returns
///
/// Name of task with `_gen` stripped off.
pub fn remove_gen_suffix(task_name: &str) -> &str {
    if task_name.ends_with(GEN_SUFFIX) {
        let end = task_name.len() - GEN_SUFFIX.len();
        &task_name[..end]
    } else {
        task_name
    }
}

/// Number of decimal digits needed to display all indexes up to `total_tasks`.
fn digits(total_tasks: usize) -> usize {
    let mut digits = 1;
    let mut n = total_tasks / 10;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}
