use marcus_core::models::{Dependency, NewTask, Priority};

/// Fluent builder for test tasks.
///
/// ```
/// use marcus_mocks::TaskBuilder;
/// let task = TaskBuilder::new("t-1")
///     .name("Build the API")
///     .priority(marcus_core::Priority::High)
///     .needs(&["rust"])
///     .after_hard("design")
///     .build();
/// assert_eq!(task.id, "t-1");
/// ```
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: NewTask,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self { task: NewTask::new(id, format!("Task {id}")) }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.task.description = description.to_string();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn hours(mut self, hours: f64) -> Self {
        self.task.estimated_hours = Some(hours);
        self
    }

    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.task.labels = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn needs(mut self, capabilities: &[&str]) -> Self {
        self.task.required_capabilities = capabilities.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn after_hard(mut self, on: &str) -> Self {
        self.task.dependencies.push(Dependency::hard(on));
        self
    }

    pub fn after_soft(mut self, on: &str) -> Self {
        self.task.dependencies.push(Dependency::soft(on));
        self
    }

    pub fn child_of(mut self, parent: &str, order: u32) -> Self {
        self.task.parent = Some(parent.to_string());
        self.task.order_index = Some(order);
        self
    }

    pub fn provides(mut self, contract: &str) -> Self {
        self.task.provides = Some(contract.to_string());
        self
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}
