use marcus_core::models::NewTask;

use crate::builders::TaskBuilder;

/// `n` tasks where each hard-depends on the previous one: t-1 <- t-2 <- ...
pub fn linear_chain(n: usize) -> Vec<NewTask> {
    (1..=n)
        .map(|i| {
            let mut builder = TaskBuilder::new(&format!("t-{i}"));
            if i > 1 {
                builder = builder.after_hard(&format!("t-{}", i - 1));
            }
            builder.build()
        })
        .collect()
}

/// `n` independent tasks, all immediately ready.
pub fn parallel_tasks(n: usize) -> Vec<NewTask> {
    (1..=n).map(|i| TaskBuilder::new(&format!("p-{i}")).build()).collect()
}

/// A parent with `n` sequential children (`<parent>-1` .. `<parent>-n`),
/// each child hard-depending on its predecessor. Parent comes first.
pub fn parent_with_children(parent: &str, n: usize) -> Vec<NewTask> {
    let mut tasks = vec![TaskBuilder::new(parent).name(&format!("Feature {parent}")).build()];
    for i in 1..=n {
        let id = format!("{parent}-{i}");
        let mut builder = TaskBuilder::new(&id).child_of(parent, i as u32);
        if i > 1 {
            builder = builder.after_hard(&format!("{parent}-{}", i - 1));
        }
        tasks.push(builder.build());
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_each_task_to_its_predecessor() {
        let chain = linear_chain(3);
        assert_eq!(chain.len(), 3);
        assert!(chain[0].dependencies.is_empty());
        assert_eq!(chain[2].dependencies[0].on, "t-2");
    }

    #[test]
    fn family_has_ordered_children() {
        let family = parent_with_children("q", 3);
        assert_eq!(family.len(), 4);
        assert_eq!(family[1].parent.as_deref(), Some("q"));
        assert_eq!(family[3].order_index, Some(3));
        assert_eq!(family[3].dependencies[0].on, "q-2");
    }
}
